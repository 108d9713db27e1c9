use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{App, Arg, ArgMatches};
use idiomcloze::config::TrainConfig;
use idiomcloze::io::TrainInfo;
use idiomcloze::train_model::{Mode, Trainer};
use tracing::info;

use crate::subcommands::IdiomClozeApp;

static CHECKPOINT: &str = "checkpoint";
static CONFIG: &str = "CONFIG";
static MODE: &str = "mode";
static OUTPUT_DIR: &str = "output-dir";
static REPLICAS: &str = "replicas";

/// Subcommand for training and evaluating affection classifiers.
pub struct TrainApp {
    config: TrainConfig,
    mode: Mode,
    n_replicas: usize,
    checkpoint: Option<PathBuf>,
    train_info: TrainInfo,
}

impl TrainApp {
    /// Get the training configuration, with command line overrides.
    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Get the train information.
    pub fn train_info(&self) -> &TrainInfo {
        &self.train_info
    }
}

impl IdiomClozeApp for TrainApp {
    fn app() -> App<'static, 'static> {
        let app = Self::common_opts("train")
            .about("Train or evaluate an affection classifier")
            .arg(
                Arg::with_name(MODE)
                    .long("mode")
                    .value_name("MODE")
                    .help("Train, evaluate a checkpoint or evaluate the best checkpoint")
                    .takes_value(true)
                    .possible_values(&["train", "eval", "infer"])
                    .default_value("train"),
            )
            .arg(
                Arg::with_name(REPLICAS)
                    .long("replicas")
                    .value_name("N")
                    .help("Number of data-parallel replicas")
                    .takes_value(true)
                    .default_value("1"),
            )
            .arg(
                Arg::with_name(CHECKPOINT)
                    .long("checkpoint")
                    .value_name("FILE")
                    .help("Checkpoint to evaluate in eval mode")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name(OUTPUT_DIR)
                    .long("output-dir")
                    .value_name("DIR")
                    .help("Output directory (overrides the configuration)")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name(CONFIG)
                    .help("Training configuration (TOML)")
                    .index(1)
                    .required(true),
            );
        Self::threads_opt(app)
    }

    fn parse(matches: &ArgMatches) -> Result<Self> {
        let config_path = matches.value_of(CONFIG).context("No configuration")?;
        let mut config = TrainConfig::read(config_path)?;

        if let Some(output_dir) = matches.value_of(OUTPUT_DIR) {
            config.output_dir = output_dir.into();
        }
        if matches.is_present(Self::THREADS) {
            config.n_workers = Self::parse_threads(matches)?;
        }
        config.validate()?;

        let mode = Mode::try_from_str(matches.value_of(MODE).context("No mode")?)?;
        let n_replicas = matches
            .value_of(REPLICAS)
            .map(|v| v.parse().context("Cannot parse number of replicas"))
            .transpose()?
            .unwrap_or(1);

        let train_info = TrainInfo::new(
            config_path.into(),
            config.output_dir.to_string_lossy().into_owned(),
            n_replicas,
            config.n_workers,
        );

        Ok(TrainApp {
            config,
            mode,
            n_replicas,
            checkpoint: matches.value_of(CHECKPOINT).map(PathBuf::from),
            train_info,
        })
    }

    fn run(&self) -> Result<()> {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        info!("SIMD features: {}", Self::simd_features().join(" "));

        let trainer = Trainer::load(self.config().clone(), self.train_info().clone())?;
        Arc::new(trainer).run(self.mode, self.n_replicas, self.checkpoint.as_deref())
    }
}
