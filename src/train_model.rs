use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, bail, ensure, Context, Error, Result};
use fnv::FnvHashMap;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::collective::{Aborted, Collective, LocalGroup, SingleProcess};
use crate::config::TrainConfig;
use crate::dataset::{AffectionDataset, DatasetBuilder, DatasetResources, Split};
use crate::eval::{Evaluation, Metrics};
use crate::io::{
    write_hps, write_idiom_embeddings, Checkpoint, IdiomEmbeddings, TrainInfo, CKPT_DIR,
    RESULTS_DIR,
};
use crate::loader::DataLoader;
use crate::model::{encode_channels, AffectionModel, Encoder, LookupEncoder, Parameters};
use crate::optim::{clip_grad_norm, Adam, LrSchedule};
use crate::store::read_csv_pairs;
use crate::synonyms::{synonym_recall, SynonymRecall, Synonyms};
use crate::util::{seeded_rng, RunningMeter};
use crate::vocab::EnlargedCandidates;

pub const HPS_FILE: &str = "hps.toml";
pub const CANDIDATES_FILE: &str = "enlarged_candidates.json";
pub const EMBEDDINGS_FILE: &str = "idioms.fifu";

/// RNG stream of parameter initialisation.
const PARAMS_STREAM: u64 = 0x5041_5241;

const LOG_INTERVAL: usize = 100;

/// What a run does with the model.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Train from scratch.
    Train,

    /// Evaluate the parameters of a checkpoint.
    Eval,

    /// Evaluate the checkpoint with the best validation results.
    Infer,
}

impl Mode {
    pub fn try_from_str(mode: &str) -> Result<Mode> {
        match mode {
            "train" => Ok(Mode::Train),
            "eval" => Ok(Mode::Eval),
            "infer" => Ok(Mode::Infer),
            _ => bail!("Unknown mode: {}", mode),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Eval => "eval",
            Mode::Infer => "infer",
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Mode::try_from_str(s)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameters a run starts from and the step they were saved at.
type Initial = Option<(Parameters, usize)>;

/// Data-parallel trainer.
///
/// The datasets, the frozen encoder and the configuration are shared by
/// all replicas of a run. Every replica holds its own copy of the model.
pub struct Trainer {
    config: TrainConfig,
    resources: Arc<DatasetResources>,
    encoder: Arc<dyn Encoder>,
    train: Arc<AffectionDataset>,
    val: Arc<AffectionDataset>,
    test: Arc<AffectionDataset>,
    synonyms: Option<Synonyms>,
    train_info: TrainInfo,
}

impl Trainer {
    pub fn new(
        config: TrainConfig,
        resources: Arc<DatasetResources>,
        encoder: Arc<dyn Encoder>,
        train_info: TrainInfo,
    ) -> Result<Self> {
        config.validate()?;
        ensure!(
            encoder.hidden_size() == config.model.hidden_size,
            "Encoder hidden size {} differs from the model hidden size {}",
            encoder.hidden_size(),
            config.model.hidden_size
        );

        let builder = DatasetBuilder::new(
            resources.clone(),
            config.dataset,
            config.model.max_txt_len,
            config.model.len_idiom_vocab,
        )?;
        let train = Arc::new(builder.build(Split::Train, &config.data.train_txt_db, None)?);
        let candidates = train.candidates().clone();
        ensure!(
            !config.model.head.has_latent_vocab() || !candidates.is_empty(),
            "Head {} requires enlarged candidates, but the training split has none",
            config.model.head
        );
        let val = Arc::new(builder.build(
            Split::Val,
            &config.data.val_txt_db,
            Some(candidates.clone()),
        )?);
        let test = Arc::new(builder.build(Split::Test, &config.data.test_txt_db, Some(candidates))?);

        let synonyms = config.data.synonyms.as_ref().map(Synonyms::read).transpose()?;

        Ok(Trainer {
            config,
            resources,
            encoder,
            train,
            val,
            test,
            synonyms,
            train_info,
        })
    }

    /// Load the vocabulary, lexicon and tokenizer of the configuration and
    /// construct the trainer with a lookup encoder.
    pub fn load(config: TrainConfig, train_info: TrainInfo) -> Result<Self> {
        let data = &config.data;
        let resources = Arc::new(DatasetResources::load(
            &data.vocab,
            &data.lexicon,
            &data.tokenizer,
        )?);
        let encoder = LookupEncoder::new(
            resources.tokenizer().vocab_size(),
            config.model.hidden_size,
            config.seed,
        );
        Self::new(config, resources, Arc::new(encoder), train_info)
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    fn dataset(&self, split: Split) -> &Arc<AffectionDataset> {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
            Split::Test => &self.test,
        }
    }

    /// Run in the given mode with `n_replicas` data-parallel replicas.
    ///
    /// `checkpoint` is only used in evaluation mode, without a checkpoint
    /// freshly initialised parameters are evaluated.
    pub fn run(self: Arc<Self>, mode: Mode, n_replicas: usize, checkpoint: Option<&Path>) -> Result<()> {
        ensure!(n_replicas > 0, "At least one replica is required");

        let initial = match mode {
            Mode::Train => {
                self.prepare_output()?;
                None
            }
            Mode::Eval => {
                self.check_candidates()?;
                checkpoint.map(|path| self.read_checkpoint(path)).transpose()?
            }
            Mode::Infer => {
                self.check_candidates()?;
                let step = self.best_checkpoint()?;
                Some(self.read_checkpoint(Checkpoint::path(self.output_dir(), step))?)
            }
        };

        let results_dir = self.output_dir().join(RESULTS_DIR);
        fs::create_dir_all(&results_dir).with_context(|| {
            format!("Cannot create results directory {}", results_dir.display())
        })?;

        info!("Running {} with {} replica(s)", mode, n_replicas);
        if n_replicas == 1 {
            return self.run_replica(mode, initial, &SingleProcess);
        }

        let mut children = Vec::with_capacity(n_replicas);
        for collective in LocalGroup::new(n_replicas) {
            let trainer = self.clone();
            let initial = initial.clone();
            children.push(
                thread::Builder::new()
                    .name(format!("replica-{}", collective.rank()))
                    .spawn(move || trainer.run_replica(mode, initial, &collective))
                    .context("Cannot spawn replica")?,
            );
        }

        // Wait until all replicas have finished, report the failure that
        // aborted the group rather than the aborted peers.
        let mut failure: Option<Error> = None;
        for child in children {
            let result = child
                .join()
                .map_err(|_| anyhow!("Replica panicked"))
                .and_then(|result| result);
            if let Err(err) = result {
                if failure.as_ref().map_or(true, is_aborted) {
                    failure = Some(err);
                }
            }
        }

        failure.map_or(Ok(()), Err)
    }

    fn run_replica(&self, mode: Mode, initial: Initial, collective: &dyn Collective) -> Result<()> {
        let result = self.run_replica_mode(mode, initial, collective);
        if result.is_err() {
            collective.abort();
        }
        result
    }

    fn run_replica_mode(
        &self,
        mode: Mode,
        initial: Initial,
        collective: &dyn Collective,
    ) -> Result<()> {
        let (params, step) = initial.unwrap_or_else(|| (self.init_params(), 0));
        let model = self.model(broadcast_parameters(params, collective)?);

        match mode {
            Mode::Train => self.train(model, collective),
            Mode::Eval | Mode::Infer => {
                for &split in &[Split::Val, Split::Test] {
                    self.evaluate(&model, collective, split, step)?;
                }
                Ok(())
            }
        }
    }

    fn init_params(&self) -> Parameters {
        let model = &self.config.model;
        Parameters::new(
            model.head,
            model.hidden_size,
            model.len_idiom_vocab,
            &mut seeded_rng(self.config.seed, PARAMS_STREAM),
        )
    }

    fn model(&self, params: Parameters) -> AffectionModel {
        AffectionModel::new(
            self.config.model.head,
            params,
            self.train.candidates().clone(),
            self.train.fine_emotion_weights(),
            self.train.sentiment_weights(),
        )
    }

    fn read_checkpoint(&self, path: impl AsRef<Path>) -> Result<(Parameters, usize)> {
        let path = path.as_ref();
        let checkpoint = Checkpoint::read(path)?;
        let step = checkpoint.step;
        let params = checkpoint
            .into_parameters(&self.config.model)
            .with_context(|| format!("Cannot restore checkpoint {}", path.display()))?;
        info!("Restored parameters of step {} from {}", step, path.display());
        Ok((params, step))
    }

    /// Create the output directory of a training run.
    fn prepare_output(&self) -> Result<()> {
        let output_dir = self.output_dir();
        let ckpt_dir = output_dir.join(CKPT_DIR);
        if ckpt_dir.is_dir() {
            let mut entries = fs::read_dir(&ckpt_dir)
                .with_context(|| format!("Cannot read {}", ckpt_dir.display()))?;
            ensure!(
                entries.next().is_none(),
                "Checkpoint directory {} is not empty, refusing to overwrite a previous run",
                ckpt_dir.display()
            );
        }
        fs::create_dir_all(&ckpt_dir)
            .with_context(|| format!("Cannot create {}", ckpt_dir.display()))?;

        write_hps(output_dir.join(HPS_FILE), &self.config, &self.train_info)?;
        self.train.candidates().write(output_dir.join(CANDIDATES_FILE))
    }

    /// Check that the candidates of earlier runs match the current ones.
    fn check_candidates(&self) -> Result<()> {
        let path = self.output_dir().join(CANDIDATES_FILE);
        if !path.exists() {
            return Ok(());
        }

        let persisted = EnlargedCandidates::read(&path)?;
        ensure!(
            &persisted == self.train.candidates().as_ref(),
            "Enlarged candidates in {} differ from the candidates of the training split",
            path.display()
        );
        Ok(())
    }

    /// Step of the checkpoint with the highest sentiment accuracy of the
    /// rank 0 validation results.
    fn best_checkpoint(&self) -> Result<usize> {
        let answers = self.val.sentiment_answers();
        let results_dir = self.output_dir().join(RESULTS_DIR);

        let mut best: Option<(usize, f32)> = None;
        for entry in fs::read_dir(&results_dir)
            .with_context(|| format!("Cannot read results directory {}", results_dir.display()))?
        {
            let entry = entry?;
            let step = match entry.file_name().to_str().and_then(|name| rank0_step(name, Split::Val)) {
                Some(step) => step,
                None => continue,
            };

            let path = entry.path();
            let f = File::open(&path).with_context(|| format!("Cannot open {}", path.display()))?;
            let predictions: FnvHashMap<String, i64> = read_csv_pairs(BufReader::new(f))
                .with_context(|| format!("Cannot read results {}", path.display()))?;
            let acc = judge(&predictions, &answers);

            let better = match best {
                Some((best_step, best_acc)) => acc > best_acc || (acc == best_acc && step < best_step),
                None => true,
            };
            if better {
                best = Some((step, acc));
            }
        }

        let (step, acc) = best.ok_or_else(|| {
            anyhow!("No validation results in {}", results_dir.display())
        })?;
        info!("Best validation accuracy {:.4} at step {}", acc, step);
        Ok(step)
    }

    fn train(&self, mut model: AffectionModel, collective: &dyn Collective) -> Result<()> {
        let optim = self.config.optim;
        ensure!(optim.num_train_steps > 0, "Number of training steps must be positive");

        let loader = DataLoader::train(
            self.train.clone(),
            self.config.train_batch_size,
            collective.rank(),
            collective.world_size(),
            self.config.n_workers,
            self.config.seed,
        );
        ensure!(loader.n_batches(0) > 0, "The training split has no instances");

        let schedule = LrSchedule::new(&optim);
        let mut adam = Adam::new(&optim, model.params());
        let progress = if collective.is_root() {
            Some(step_progress(optim.num_train_steps))
        } else {
            None
        };

        let mut meter = RunningMeter::new("loss");
        let mut best: Option<(usize, f32)> = None;
        let mut grad_sum = vec![0f32; model.params().n_values()];
        let mut n_micro = 0;
        let mut micro_loss = 0f32;
        let mut n_examples = 0;
        let mut start = Instant::now();
        let mut step = 0;

        let mut epoch = 0;
        'training: loop {
            for batch in loader.epoch(epoch) {
                let hidden = encode_channels(self.encoder.as_ref(), &batch);
                let forward = model.forward(&hidden, &batch);
                let losses = model.loss(&forward, &batch);
                for (sum, grad) in grad_sum
                    .iter_mut()
                    .zip(model.backward(&forward, &losses).to_flat())
                {
                    *sum += grad;
                }
                micro_loss += losses.objective();
                n_micro += 1;
                n_examples += batch.len();

                if n_micro < optim.gradient_accumulation_steps {
                    continue;
                }

                let lr = schedule.lr(step + 1);
                self.update(&mut model, &mut adam, collective, &mut grad_sum, n_micro, lr)?;
                meter.update(micro_loss / n_micro as f32);
                n_micro = 0;
                micro_loss = 0.;
                step += 1;

                if let Some(progress) = &progress {
                    progress.set_position(step as u64);
                    progress.set_message(&format!("{}: {:.5} lr: {:.5}", meter.name(), meter.val(), lr));
                }

                if step % LOG_INTERVAL == 0 && collective.is_root() {
                    let throughput = (n_examples * collective.world_size()) as f32
                        / start.elapsed().as_secs_f32();
                    info!(
                        "Step {}: {} {:.4}, lr {:.2e}, {:.0} ex/s",
                        step,
                        meter.name(),
                        meter.val(),
                        lr,
                        throughput
                    );
                    n_examples = 0;
                    start = Instant::now();
                }

                if step % self.config.valid_steps == 0 || step == optim.num_train_steps {
                    best = self.validate(&model, collective, step, best)?;
                }

                if step == optim.num_train_steps {
                    break 'training;
                }
            }

            epoch += 1;
        }

        if let Some(progress) = progress {
            progress.finish();
        }

        // The last step is always validated.
        let (best_step, best_acc) = best.expect("No validation results after training");
        if collective.is_root() {
            info!("Best validation accuracy {:.4} at step {}", best_acc, best_step);
        }

        let (params, _) = self.read_checkpoint(Checkpoint::path(self.output_dir(), best_step))?;
        let best_model = self.model(params);
        for &split in &[Split::Val, Split::Test] {
            self.evaluate(&best_model, collective, split, best_step)?;
        }

        if collective.is_root() {
            self.export(&best_model)?;
        }

        Ok(())
    }

    /// Average the accumulated gradients over micro-batches and replicas
    /// and apply an optimizer step.
    fn update(
        &self,
        model: &mut AffectionModel,
        adam: &mut Adam,
        collective: &dyn Collective,
        grad_sum: &mut [f32],
        n_micro: usize,
        lr: f32,
    ) -> Result<()> {
        collective.all_reduce_sum(grad_sum)?;
        let scale = 1. / (n_micro * collective.world_size()) as f32;
        grad_sum.iter_mut().for_each(|grad| *grad *= scale);

        let mut grads = model.params().zeros_like();
        grads.assign_flat(grad_sum);
        if self.config.optim.grad_norm > 0. {
            clip_grad_norm(&mut grads, self.config.optim.grad_norm);
        }

        adam.step(model.params_mut(), &grads, lr);
        grad_sum.iter_mut().for_each(|grad| *grad = 0.);
        Ok(())
    }

    /// Evaluate on the validation split and save a checkpoint.
    ///
    /// Returns the step and accuracy of the best checkpoint so far.
    fn validate(
        &self,
        model: &AffectionModel,
        collective: &dyn Collective,
        step: usize,
        best: Option<(usize, f32)>,
    ) -> Result<Option<(usize, f32)>> {
        let metrics = self.evaluate(model, collective, Split::Val, step)?;

        let written = if collective.is_root() {
            Checkpoint::new(&self.config.model, model.params(), step)
                .write(Checkpoint::path(self.output_dir(), step))
        } else {
            Ok(())
        };
        // Replicas read the checkpoint after training.
        collective.barrier()?;
        written?;

        match best {
            Some((_, best_acc)) if best_acc >= metrics.acc => Ok(best),
            _ => Ok(Some((step, metrics.acc))),
        }
    }

    /// Evaluate a split, every replica evaluates its shard.
    ///
    /// Predictions are written per rank and concatenated by the root.
    fn evaluate(
        &self,
        model: &AffectionModel,
        collective: &dyn Collective,
        split: Split,
        step: usize,
    ) -> Result<Metrics> {
        let rank = collective.rank();
        let loader = DataLoader::eval(
            self.dataset(split).clone(),
            self.config.val_batch_size,
            rank,
            collective.world_size(),
            self.config.n_workers,
            self.config.seed,
        );

        let start = Instant::now();
        let mut evaluation = Evaluation::new();
        for batch in loader.epoch(0) {
            let hidden = encode_channels(self.encoder.as_ref(), &batch);
            let forward = model.forward(&hidden, &batch);
            let losses = model.loss(&forward, &batch);
            evaluation.update(&batch, &forward, &losses);
        }

        let results_dir = self.output_dir().join(RESULTS_DIR);
        let written = write_predictions(
            results_dir.join(rank_results_file(split, step, rank)),
            evaluation.predictions(),
        );

        // All predictions are written once the metrics are reduced.
        let mut metrics = evaluation.gather_metrics(collective)?;
        written?;

        if collective.is_root() {
            if split == Split::Val {
                metrics.synonym_recall = self.synonym_recall(model);
            }
            merge_predictions(&results_dir, split, step, collective.world_size())?;
            info!(
                "{} at step {}: {}, {:.0} ex/s",
                split,
                step,
                metrics,
                metrics.n_examples as f32 / start.elapsed().as_secs_f32()
            );
        }

        Ok(metrics)
    }

    fn synonym_recall(&self, model: &AffectionModel) -> Option<SynonymRecall> {
        let synonyms = self.synonyms.as_ref()?;
        let embeddings = model.params().idiom_embedding.as_ref()?;
        Some(synonym_recall(self.resources.vocab(), embeddings.view(), synonyms))
    }

    fn export(&self, model: &AffectionModel) -> Result<()> {
        let embeddings = match &model.params().idiom_embedding {
            Some(embeddings) => embeddings.clone(),
            None => {
                info!("Head {} has no idiom embeddings to export", model.head());
                return Ok(());
            }
        };

        let path = self.output_dir().join(EMBEDDINGS_FILE);
        write_idiom_embeddings(
            &path,
            IdiomEmbeddings::new(self.resources.vocab(), embeddings, &self.config),
            self.train_info.clone(),
        )?;
        info!("Wrote idiom embeddings to {}", path.display());

        Ok(())
    }
}

fn broadcast_parameters(mut params: Parameters, collective: &dyn Collective) -> Result<Parameters> {
    let mut values = params.to_flat();
    collective.broadcast(&mut values, 0)?;
    params.assign_flat(&values);
    Ok(params)
}

fn is_aborted(err: &Error) -> bool {
    err.root_cause().is::<Aborted>()
}

fn step_progress(n_steps: usize) -> ProgressBar {
    let progress = ProgressBar::new(n_steps as u64);
    progress.set_style(
        ProgressStyle::default_bar().template("{bar:30} {pos}/{len} {msg} ETA: {eta_precise}"),
    );
    progress
}

fn rank_results_file(split: Split, step: usize, rank: usize) -> String {
    format!("{}_results_{}_rank{}.csv", split, step, rank)
}

/// Step of a rank 0 results file of the split.
fn rank0_step(file_name: &str, split: Split) -> Option<usize> {
    file_name
        .strip_prefix(&format!("{}_results_", split))?
        .strip_suffix("_rank0.csv")?
        .parse()
        .ok()
}

/// Accuracy of the predictions of the instances with an answer.
fn judge(predictions: &FnvHashMap<String, i64>, answers: &FnvHashMap<String, i64>) -> f32 {
    let (n, correct) = predictions
        .iter()
        .filter_map(|(qid, prediction)| answers.get(qid).map(|answer| prediction == answer))
        .fold((0, 0), |(n, correct), is_correct| (n + 1, correct + is_correct as usize));

    if n == 0 {
        0.
    } else {
        correct as f32 / n as f32
    }
}

fn write_predictions(path: impl AsRef<Path>, predictions: &[(String, usize)]) -> Result<()> {
    let path = path.as_ref();
    let f = File::create(path).with_context(|| format!("Cannot create {}", path.display()))?;
    let mut writer = BufWriter::new(f);
    for (qid, prediction) in predictions {
        writeln!(writer, "{},{}", qid, prediction)
            .with_context(|| format!("Cannot write {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("Cannot flush {}", path.display()))
}

/// Concatenate the results of all ranks.
fn merge_predictions(results_dir: &Path, split: Split, step: usize, world_size: usize) -> Result<PathBuf> {
    let path = results_dir.join(format!("{}_results_{}.csv", split, step));
    let f = File::create(&path).with_context(|| format!("Cannot create {}", path.display()))?;
    let mut writer = BufWriter::new(f);

    for rank in 0..world_size {
        let rank_path = results_dir.join(rank_results_file(split, step, rank));
        let f = File::open(&rank_path)
            .with_context(|| format!("Cannot open {}", rank_path.display()))?;
        for line in BufReader::new(f).lines() {
            let line = line.with_context(|| format!("Cannot read {}", rank_path.display()))?;
            writeln!(writer, "{}", line)
                .with_context(|| format!("Cannot write {}", path.display()))?;
        }
    }

    writer
        .flush()
        .with_context(|| format!("Cannot flush {}", path.display()))?;
    Ok(path)
}
