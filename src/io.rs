use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, ensure, Context, Result};
use chrono::Local;
use finalfusion::io::WriteEmbeddings;
use finalfusion::metadata::Metadata;
use finalfusion::norms::NdNorms;
use finalfusion::prelude::{Embeddings, VocabWrap};
use finalfusion::storage::NdArray;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use toml::Value;

use crate::config::{HeadType, ModelConfig, TrainConfig};
use crate::model::Parameters;
use crate::store::{read_json, write_json};
use crate::util::{seeded_rng, VersionInfo};
use crate::vec_simd::l2_normalize;
use crate::vocab::IdiomVocab;

/// Checkpoint directory within the output directory.
pub const CKPT_DIR: &str = "ckpt";

/// Results directory within the output directory.
pub const RESULTS_DIR: &str = "results";

pub struct FileProgress {
    inner: File,
    progress: ProgressBar,
}

/// A progress bar that implements the `Read` trait.
///
/// This wrapper of `indicatif`'s `ProgressBar` updates progress based on the
/// current offset within the file.
impl FileProgress {
    pub fn new(file: File) -> io::Result<Self> {
        let metadata = file.metadata()?;
        let progress = ProgressBar::new(metadata.len());
        progress.set_style(
            ProgressStyle::default_bar()
                .template("{bar:30} {bytes}/{total_bytes} ETA: {eta_precise}"),
        );

        Ok(FileProgress {
            inner: file,
            progress,
        })
    }
}

impl Read for FileProgress {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n_read = self.inner.read(buf)?;
        let pos = self.inner.seek(SeekFrom::Current(0))?;
        self.progress.set_position(pos);
        Ok(n_read)
    }
}

impl Drop for FileProgress {
    fn drop(&mut self) {
        self.progress.finish();
    }
}

/// Bookkeeping of a training run.
#[derive(Clone, Debug, Serialize)]
pub struct TrainInfo {
    config: String,
    output_dir: String,
    n_replicas: usize,
    n_threads: usize,
    start_datetime: String,
    end_datetime: Option<String>,
}

impl TrainInfo {
    /// Construct new training information.
    ///
    /// The start time is set to the current time.
    pub fn new(config: String, output_dir: String, n_replicas: usize, n_threads: usize) -> Self {
        let start_datetime = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        TrainInfo {
            config,
            output_dir,
            n_replicas,
            n_threads,
            start_datetime,
            end_datetime: None,
        }
    }

    pub fn config(&self) -> &str {
        &self.config
    }

    pub fn output_dir(&self) -> &str {
        &self.output_dir
    }

    pub fn n_replicas(&self) -> usize {
        self.n_replicas
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    pub fn start_datetime(&self) -> &str {
        &self.start_datetime
    }

    pub fn end_datetime(&self) -> Option<&str> {
        self.end_datetime.as_deref()
    }

    /// Set the end time to the current time.
    pub fn set_end(&mut self) {
        let end_datetime = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        self.end_datetime = Some(end_datetime);
    }
}

/// Metadata table with the training configuration, version and run
/// information.
fn run_metadata(config: &TrainConfig, train_info: &TrainInfo) -> Result<Value> {
    let mut metadata = Value::try_from(config)?;
    let metadata_table = metadata
        .as_table_mut()
        .ok_or_else(|| anyhow!("Metadata has to be 'Table'."))?;
    metadata_table.insert(
        "version_info".to_string(),
        Value::try_from(VersionInfo::new())?,
    );
    metadata_table.insert("training_info".to_string(), Value::try_from(train_info)?);
    Ok(metadata)
}

/// Write the hyperparameters of a run as TOML.
pub fn write_hps(path: impl AsRef<Path>, config: &TrainConfig, train_info: &TrainInfo) -> Result<()> {
    let path = path.as_ref();
    let metadata = run_metadata(config, train_info)?;
    fs::write(path, metadata.to_string())
        .with_context(|| format!("Cannot write hyperparameters to {}", path.display()))
}

/// Model parameters at an optimizer step.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Checkpoint {
    pub head: HeadType,
    pub hidden_size: usize,
    pub len_idiom_vocab: usize,
    pub step: usize,

    /// Flattened parameters.
    pub values: Vec<f32>,
}

impl Checkpoint {
    pub fn new(config: &ModelConfig, params: &Parameters, step: usize) -> Self {
        Checkpoint {
            head: config.head,
            hidden_size: config.hidden_size,
            len_idiom_vocab: config.len_idiom_vocab,
            step,
            values: params.to_flat(),
        }
    }

    /// Path of the checkpoint of a step.
    pub fn path(output_dir: impl AsRef<Path>, step: usize) -> PathBuf {
        output_dir
            .as_ref()
            .join(CKPT_DIR)
            .join(format!("model_step_{}.json", step))
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        read_json(path)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        write_json(path, self)
    }

    /// Restore the parameters, the checkpoint must match the model
    /// configuration.
    pub fn into_parameters(self, config: &ModelConfig) -> Result<Parameters> {
        ensure!(
            self.head == config.head,
            "Checkpoint of head {} cannot be loaded into head {}",
            self.head,
            config.head
        );
        ensure!(
            self.hidden_size == config.hidden_size && self.len_idiom_vocab == config.len_idiom_vocab,
            "Checkpoint dimensions ({}, {}) differ from the configuration ({}, {})",
            self.hidden_size,
            self.len_idiom_vocab,
            config.hidden_size,
            config.len_idiom_vocab
        );

        let mut params = Parameters::new(
            self.head,
            self.hidden_size,
            self.len_idiom_vocab,
            &mut seeded_rng(0, 0),
        );
        ensure!(
            params.n_values() == self.values.len(),
            "Checkpoint has {} values, the model has {}",
            self.values.len(),
            params.n_values()
        );
        params.assign_flat(&self.values);

        Ok(params)
    }
}

/// Trait for writing models in binary format.
pub trait WriteModelBinary<W>
where
    W: Write,
{
    fn write_model_binary(self, write: &mut W, train_info: TrainInfo) -> Result<()>;
}

/// Trained idiom embeddings with the configuration they were trained with.
pub struct IdiomEmbeddings<'a> {
    vocab: &'a IdiomVocab,
    embeddings: Array2<f32>,
    config: &'a TrainConfig,
}

impl<'a> IdiomEmbeddings<'a> {
    /// Construct from an idiom embedding table, row *i* is the embedding
    /// of idiom *i*.
    pub fn new(vocab: &'a IdiomVocab, embeddings: Array2<f32>, config: &'a TrainConfig) -> Self {
        assert!(
            embeddings.nrows() <= vocab.len(),
            "Embedding table has more rows than the vocabulary has idioms"
        );
        IdiomEmbeddings {
            vocab,
            embeddings,
            config,
        }
    }
}

impl<'a, W> WriteModelBinary<W> for IdiomEmbeddings<'a>
where
    W: Seek + Write,
{
    fn write_model_binary(self, write: &mut W, mut train_info: TrainInfo) -> Result<()> {
        train_info.set_end();
        let metadata = run_metadata(self.config, &train_info)?;

        let mut matrix = self.embeddings;
        let norms: Vec<f32> = matrix
            .axis_iter_mut(Axis(0))
            .map(|embedding| l2_normalize(embedding))
            .collect();

        // Only idioms with a row in the table are exported.
        let vocab: VocabWrap =
            IdiomVocab::new(self.vocab.idioms()[..matrix.nrows()].to_vec()).into();
        let storage = NdArray::new(matrix);
        let norms = NdNorms::new(Array1::from(norms));

        Embeddings::new(Some(Metadata::new(metadata)), vocab, storage, norms)
            .write_embeddings(write)
            .map_err(|err| err.into())
    }
}

/// Write idiom embeddings to a finalfusion file.
pub fn write_idiom_embeddings(
    path: impl AsRef<Path>,
    embeddings: IdiomEmbeddings,
    train_info: TrainInfo,
) -> Result<()> {
    let path = path.as_ref();
    let f = File::create(path)
        .with_context(|| format!("Cannot create embeddings file {}", path.display()))?;
    let mut writer = BufWriter::new(f);
    embeddings.write_model_binary(&mut writer, train_info)?;
    writer
        .flush()
        .with_context(|| format!("Cannot flush embeddings file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::io::{BufReader, Cursor};

    use finalfusion::io::ReadEmbeddings;
    use finalfusion::prelude::{Embeddings, StorageWrap, VocabWrap};
    use finalfusion::vocab::Vocab;
    use ndarray::arr2;

    use super::{Checkpoint, IdiomEmbeddings, TrainInfo, WriteModelBinary};
    use crate::config::tests::CONFIG;
    use crate::config::{HeadType, TrainConfig};
    use crate::model::Parameters;
    use crate::store::tests::scratch_dir;
    use crate::util::{all_close, seeded_rng};
    use crate::vocab::IdiomVocab;

    fn config() -> TrainConfig {
        toml::from_str(CONFIG).unwrap()
    }

    #[test]
    fn checkpoint_round_trip() {
        let config = config();
        let params = Parameters::new(
            config.model.head,
            config.model.hidden_size,
            config.model.len_idiom_vocab,
            &mut seeded_rng(3, 0),
        );

        let dir = scratch_dir("checkpoint");
        std::fs::create_dir_all(dir.join(super::CKPT_DIR)).unwrap();
        let path = Checkpoint::path(&dir, 40);
        assert!(path.ends_with("ckpt/model_step_40.json"));

        Checkpoint::new(&config.model, &params, 40).write(&path).unwrap();
        let checkpoint = Checkpoint::read(&path).unwrap();
        assert_eq!(checkpoint.step, 40);
        assert_eq!(checkpoint.into_parameters(&config.model).unwrap(), params);
    }

    #[test]
    fn checkpoint_must_match_config() {
        let config = config();
        let params = Parameters::new(
            config.model.head,
            config.model.hidden_size,
            config.model.len_idiom_vocab,
            &mut seeded_rng(3, 0),
        );
        let checkpoint = Checkpoint::new(&config.model, &params, 1);

        let mut other = config.model;
        other.head = HeadType::LatentIdiom;
        assert!(checkpoint.clone().into_parameters(&other).is_err());

        let mut other = config.model;
        other.hidden_size += 1;
        assert!(checkpoint.clone().into_parameters(&other).is_err());

        let mut truncated = checkpoint;
        truncated.values.pop();
        assert!(truncated.into_parameters(&config.model).is_err());
    }

    #[test]
    fn train_info_records_end() {
        let mut info = TrainInfo::new("train.toml".into(), "output".into(), 2, 4);
        assert!(info.end_datetime().is_none());
        info.set_end();
        assert!(info.end_datetime().is_some());
        assert_eq!(info.n_replicas(), 2);
    }

    #[test]
    fn export_normalized_embeddings() {
        let config = config();
        let vocab = IdiomVocab::new(vec![
            "守株待兔".to_string(),
            "画蛇添足".to_string(),
            "对牛弹琴".to_string(),
        ]);
        let table = arr2(&[[3., 4.], [0., 2.]]);
        let info = TrainInfo::new("train.toml".into(), "output".into(), 1, 1);

        let mut data = Cursor::new(Vec::new());
        IdiomEmbeddings::new(&vocab, table, &config)
            .write_model_binary(&mut data, info)
            .unwrap();

        data.set_position(0);
        let embeddings: Embeddings<VocabWrap, StorageWrap> =
            Embeddings::read_embeddings(&mut BufReader::new(data)).unwrap();
        assert_eq!(embeddings.vocab().words_len(), 2);
        let embedding = embeddings.embedding("守株待兔").unwrap();
        assert!(all_close(embedding.as_slice().unwrap(), &[0.6, 0.8], 1e-6));
        assert!(embeddings.embedding("对牛弹琴").is_none());

        let metadata = embeddings.metadata().unwrap();
        assert!(metadata.get("version_info").is_some());
        assert!(metadata.get("training_info").is_some());
        assert_eq!(
            metadata["model"]["head"].as_str(),
            Some("latent-idiom-gate")
        );
    }
}
