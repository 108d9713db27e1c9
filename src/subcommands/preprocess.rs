use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{App, Arg, ArgMatches};
use fnv::FnvHashSet;
use idiomcloze::dataset::Split;
use idiomcloze::lexicon::{read_idiom_list, Lexicon};
use idiomcloze::preprocess::{idiom_ids, Preprocessor};
use idiomcloze::tokenizer::load_tokenizer;
use idiomcloze::vocab::IdiomVocab;
use tracing::info;

use crate::subcommands::IdiomClozeApp;

static LABELLED: &str = "labelled";
static LEXICON: &str = "lexicon";
static RECORDS: &str = "RECORDS";
static SPLIT: &str = "split";
static STORE_DIR: &str = "STORE_DIR";
static TOKENIZER: &str = "tokenizer";
static UNLABELLED: &str = "unlabelled";
static VOCAB: &str = "vocab";

/// Subcommand for converting cloze records into an instance store.
pub struct PreprocessApp {
    split: Split,
    records: Vec<PathBuf>,
    store_dir: PathBuf,
    vocab: PathBuf,
    tokenizer: PathBuf,
    lexicon: PathBuf,
    labelled: Option<PathBuf>,
    unlabelled: Option<PathBuf>,
}

impl IdiomClozeApp for PreprocessApp {
    fn app() -> App<'static, 'static> {
        Self::common_opts("preprocess")
            .about("Convert cloze records of a split into an instance store")
            .arg(
                Arg::with_name(SPLIT)
                    .long("split")
                    .value_name("SPLIT")
                    .help("Data split")
                    .takes_value(true)
                    .possible_values(&["train", "val", "test"])
                    .required(true),
            )
            .arg(
                Arg::with_name(VOCAB)
                    .long("vocab")
                    .value_name("FILE")
                    .help("Idiom vocabulary, one idiom per line")
                    .takes_value(true)
                    .required(true),
            )
            .arg(
                Arg::with_name(TOKENIZER)
                    .long("tokenizer")
                    .value_name("FILE")
                    .help("tokenizer.json or vocab.txt")
                    .takes_value(true)
                    .required(true),
            )
            .arg(
                Arg::with_name(LEXICON)
                    .long("lexicon")
                    .value_name("FILE")
                    .help("Affective lexicon")
                    .takes_value(true)
                    .required(true),
            )
            .arg(
                Arg::with_name(LABELLED)
                    .long("labelled")
                    .value_name("FILE")
                    .help("JSON list of the labelled idioms of the split (default: lexicon idioms)")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name(UNLABELLED)
                    .long("unlabelled")
                    .value_name("FILE")
                    .help("JSON list of unlabelled idioms used for training")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name(RECORDS)
                    .help("Cloze records, one JSON object per line")
                    .multiple(true)
                    .required(true),
            )
            .arg(
                Arg::with_name(STORE_DIR)
                    .help("Instance store output directory")
                    .required(true),
            )
    }

    fn parse(matches: &ArgMatches) -> Result<Self> {
        let split = Split::try_from_str(matches.value_of(SPLIT).context("No split")?)?;
        let records = matches
            .values_of(RECORDS)
            .context("No record files")?
            .map(PathBuf::from)
            .collect();

        Ok(PreprocessApp {
            split,
            records,
            store_dir: matches.value_of(STORE_DIR).context("No store directory")?.into(),
            vocab: matches.value_of(VOCAB).context("No vocabulary")?.into(),
            tokenizer: matches.value_of(TOKENIZER).context("No tokenizer")?.into(),
            lexicon: matches.value_of(LEXICON).context("No lexicon")?.into(),
            labelled: matches.value_of(LABELLED).map(PathBuf::from),
            unlabelled: matches.value_of(UNLABELLED).map(PathBuf::from),
        })
    }

    fn run(&self) -> Result<()> {
        let f = File::open(&self.vocab)
            .with_context(|| format!("Cannot open idiom vocabulary {}", self.vocab.display()))?;
        let vocab = IdiomVocab::read(BufReader::new(f))?;
        let tokenizer = load_tokenizer(&self.tokenizer)?;

        let labelled: FnvHashSet<usize> = match &self.labelled {
            Some(path) => idiom_ids(&vocab, &read_idiom_list(path)?),
            None => Lexicon::read(&self.lexicon)?
                .by_id(&vocab)
                .keys()
                .copied()
                .collect(),
        };
        let unlabelled = match &self.unlabelled {
            Some(path) => idiom_ids(&vocab, &read_idiom_list(path)?),
            None => FnvHashSet::default(),
        };
        info!(
            "{} labelled and {} unlabelled idioms",
            labelled.len(),
            unlabelled.len()
        );

        Preprocessor::new(self.split, &vocab, tokenizer.as_ref(), labelled, unlabelled)
            .run(&self.records, &self.store_dir)?;

        Ok(())
    }
}
