use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{App, Arg, ArgMatches};
use idiomcloze::io::FileProgress;
use idiomcloze::preprocess::Record;
use idiomcloze::vocab::{Cutoff, IdiomVocab, VocabBuilder};
use tracing::info;

use crate::subcommands::IdiomClozeApp;

static RECORDS: &str = "RECORDS";
static VOCAB: &str = "VOCAB";
static MINCOUNT: &str = "mincount";
static TARGET_SIZE: &str = "target-size";

/// Subcommand for building an idiom vocabulary from cloze records.
pub struct VocabApp {
    records: Vec<PathBuf>,
    vocab: PathBuf,
    cutoff: Cutoff,
}

impl IdiomClozeApp for VocabApp {
    fn app() -> App<'static, 'static> {
        Self::common_opts("vocab")
            .about("Build an idiom vocabulary from the gold idioms of records")
            .arg(
                Arg::with_name(MINCOUNT)
                    .long("mincount")
                    .value_name("FREQ")
                    .help("Minimum idiom frequency")
                    .takes_value(true)
                    .conflicts_with(TARGET_SIZE),
            )
            .arg(
                Arg::with_name(TARGET_SIZE)
                    .long("target-size")
                    .value_name("N")
                    .help("Keep the N most frequent idioms")
                    .takes_value(true),
            )
            .arg(
                Arg::with_name(RECORDS)
                    .help("Cloze records, one JSON object per line")
                    .multiple(true)
                    .required(true),
            )
            .arg(
                Arg::with_name(VOCAB)
                    .help("Vocabulary output, one idiom per line")
                    .required(true),
            )
    }

    fn parse(matches: &ArgMatches) -> Result<Self> {
        let records = matches
            .values_of(RECORDS)
            .context("No record files")?
            .map(PathBuf::from)
            .collect();
        let vocab = matches.value_of(VOCAB).context("No vocabulary output")?.into();

        let cutoff = match (matches.value_of(MINCOUNT), matches.value_of(TARGET_SIZE)) {
            (_, Some(target_size)) => Cutoff::TargetSize(
                target_size
                    .parse()
                    .context("Cannot parse vocabulary target size")?,
            ),
            (Some(min_count), None) => {
                Cutoff::MinCount(min_count.parse().context("Cannot parse mincount")?)
            }
            (None, None) => Cutoff::MinCount(1),
        };

        Ok(VocabApp {
            records,
            vocab,
            cutoff,
        })
    }

    fn run(&self) -> Result<()> {
        let mut builder = VocabBuilder::new(self.cutoff);
        for path in &self.records {
            count_idioms(path, &mut builder)?;
        }

        let n_types = builder.n_types();
        info!(
            "Counted {} occurrences of {} idioms",
            builder.n_items(),
            n_types
        );

        let vocab: IdiomVocab = builder.into();
        info!("Keeping {} of {} idioms", vocab.len(), n_types);

        let f = File::create(&self.vocab).with_context(|| {
            format!("Cannot create vocabulary {}", self.vocab.display())
        })?;
        let mut writer = BufWriter::new(f);
        vocab.write(&mut writer)?;
        writer.flush().context("Cannot flush vocabulary")
    }
}

fn count_idioms(path: &Path, builder: &mut VocabBuilder<String>) -> Result<()> {
    let f = File::open(path).with_context(|| format!("Cannot open records {}", path.display()))?;
    let file_progress = FileProgress::new(f).context("Cannot create progress bar")?;

    for (line_idx, line) in BufReader::new(file_progress).lines().enumerate() {
        let line = line.with_context(|| format!("Cannot read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }

        let record: Record = serde_json::from_str(&line).with_context(|| {
            format!(
                "Malformed record on line {} of {}",
                line_idx + 1,
                path.display()
            )
        })?;
        for idiom in record.ground_truth {
            builder.count(idiom);
        }
    }

    Ok(())
}
