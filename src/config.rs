use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, ensure, Context, Error, Result};
use serde::{Deserialize, Serialize};

use crate::util::N_OPTIONS;

/// Model heads.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeadType {
    /// Max-pooled span of the visible idiom.
    MaxPooling,

    /// Max-pooled spans of the visible and the masked idiom, composed
    /// through a projection.
    MaxPoolingMasked,

    /// As `MaxPoolingMasked`, the masked channel is enriched with a soft
    /// lookup in the idiom embedding table.
    LatentIdiom,

    /// As `LatentIdiom`, the channels are fused through a learned gate.
    LatentIdiomGate,
}

impl HeadType {
    pub fn try_from_str(head: &str) -> Result<HeadType> {
        match head {
            "max-pooling" => Ok(HeadType::MaxPooling),
            "max-pooling-masked" => Ok(HeadType::MaxPoolingMasked),
            "latent-idiom" => Ok(HeadType::LatentIdiom),
            "latent-idiom-gate" => Ok(HeadType::LatentIdiomGate),
            _ => bail!("Unknown head type: {}", head),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HeadType::MaxPooling => "max-pooling",
            HeadType::MaxPoolingMasked => "max-pooling-masked",
            HeadType::LatentIdiom => "latent-idiom",
            HeadType::LatentIdiomGate => "latent-idiom-gate",
        }
    }

    /// Number of input channels the head consumes.
    pub fn n_channels(self) -> usize {
        match self {
            HeadType::MaxPooling => 1,
            _ => 2,
        }
    }

    /// Whether the head scores the enlarged candidates.
    pub fn has_latent_vocab(self) -> bool {
        matches!(self, HeadType::LatentIdiom | HeadType::LatentIdiomGate)
    }

    pub fn has_gate(self) -> bool {
        self == HeadType::LatentIdiomGate
    }
}

impl FromStr for HeadType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        HeadType::try_from_str(s)
    }
}

impl fmt::Display for HeadType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn default_true() -> bool {
    true
}

/// Dataset pipeline toggles.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetVariant {
    /// Assemble the visible idiom within its context. Without context the
    /// visible channel only holds the idiom.
    #[serde(default = "default_true")]
    pub use_context: bool,

    /// Add a second channel in which the idiom is masked.
    #[serde(default)]
    pub masked: bool,

    /// Train on instances of unlabelled idioms as well.
    #[serde(default)]
    pub use_unlabeled: bool,
}

impl Default for DatasetVariant {
    fn default() -> Self {
        DatasetVariant {
            use_context: true,
            masked: false,
            use_unlabeled: false,
        }
    }
}

/// Locations of the preprocessed data.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DataConfig {
    pub train_txt_db: PathBuf,
    pub val_txt_db: PathBuf,
    pub test_txt_db: PathBuf,

    /// Idiom vocabulary, one idiom per line.
    pub vocab: PathBuf,

    /// Affective lexicon.
    pub lexicon: PathBuf,

    /// `tokenizer.json` or `vocab.txt`.
    pub tokenizer: PathBuf,

    /// Synonym dictionary for evaluating the idiom embeddings.
    #[serde(default)]
    pub synonyms: Option<PathBuf>,
}

/// Model dimensions.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub head: HeadType,
    pub hidden_size: usize,

    /// Only idioms with a smaller id are used.
    pub len_idiom_vocab: usize,

    /// Token budget of a windowed context, including boundary markers.
    pub max_txt_len: usize,
}

/// Optimizer hyperparameters.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct OptimConfig {
    pub learning_rate: f32,
    pub betas: [f32; 2],
    pub weight_decay: f32,
    pub warmup_steps: usize,
    pub num_train_steps: usize,

    /// Maximum global gradient norm, `-1` disables clipping.
    pub grad_norm: f32,
    pub gradient_accumulation_steps: usize,
}

/// Training configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TrainConfig {
    pub data: DataConfig,
    pub dataset: DatasetVariant,
    pub model: ModelConfig,
    pub optim: OptimConfig,
    pub output_dir: PathBuf,
    pub train_batch_size: usize,
    pub val_batch_size: usize,

    /// Validate every `valid_steps` optimizer steps.
    pub valid_steps: usize,
    pub seed: u64,

    /// Instance construction threads per replica.
    pub n_workers: usize,
}

impl TrainConfig {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("Cannot read configuration {}", path.display()))?;
        let config: TrainConfig = toml::from_str(&data)
            .with_context(|| format!("Cannot parse configuration {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the hyperparameters are consistent.
    pub fn validate(&self) -> Result<()> {
        let head = self.model.head;
        ensure!(
            (head.n_channels() == 2) == self.dataset.masked,
            "Head {} requires a dataset {} masked channel",
            head,
            if self.dataset.masked {
                "without"
            } else {
                "with"
            }
        );
        ensure!(
            self.model.max_txt_len >= 4,
            "Maximum text length must be at least 4"
        );
        ensure!(
            self.model.len_idiom_vocab >= N_OPTIONS,
            "The idiom vocabulary must hold at least {} idioms",
            N_OPTIONS
        );
        ensure!(self.model.hidden_size > 0, "Hidden size must be positive");
        ensure!(
            self.train_batch_size > 0 && self.val_batch_size > 0,
            "Batch sizes must be positive"
        );
        ensure!(
            self.optim.gradient_accumulation_steps > 0,
            "Gradient accumulation steps must be positive"
        );
        ensure!(self.valid_steps > 0, "Validation interval must be positive");
        ensure!(self.n_workers > 0, "At least one worker is required");
        ensure!(
            self.optim.grad_norm == -1. || self.optim.grad_norm > 0.,
            "Gradient norm must be positive or -1"
        );
        Ok(())
    }
}
