use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use fnv::FnvHashSet;
use serde::Deserialize;
use tracing::info;

use crate::dataset::Split;
use crate::io::FileProgress;
use crate::lexicon::write_id_list;
use crate::store::{Instance, StoreWriter, UNLABELLED_FILE};
use crate::tokenizer::{Tokenizer, MASK_TOKEN, UNK_TOKEN};
use crate::util::{IGNORE_INDEX, N_OPTIONS};
use crate::vocab::IdiomVocab;

/// Placeholder of an idiom in the content of a record.
pub const IDIOM_PLACEHOLDER: &str = "#idiom#";

/// Tags of a record are spaced by this stride.
const TAG_STRIDE: usize = 20;

/// A cloze record: content with idiom placeholders, the gold idiom of
/// every placeholder and optionally seven options per placeholder.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Record {
    pub content: String,
    pub ground_truth: Vec<String>,
    #[serde(default)]
    pub candidates: Option<Vec<Vec<String>>>,
}

/// One placeholder of a record, rewritten to a uniquely tagged context.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Blank {
    pub tag: String,
    pub context: String,
    pub idiom: String,
    pub options: Vec<String>,
}

/// Tag of the `occurrence`-th placeholder of the `idx`-th record.
pub fn instance_tag(idx: usize, occurrence: usize) -> String {
    format!("#idiom{:06}#", idx * TAG_STRIDE + occurrence)
}

impl Record {
    /// Blanks of the record, one per placeholder with a gold idiom.
    ///
    /// The placeholder of a blank is replaced by its tag, the other
    /// placeholders by the unknown token.
    pub fn blanks(&self, idx: usize) -> Result<Vec<Blank>> {
        let placeholders: Vec<usize> = self
            .content
            .match_indices(IDIOM_PLACEHOLDER)
            .map(|(offset, _)| offset)
            .collect();

        let mut blanks = Vec::with_capacity(placeholders.len());
        for (occurrence, (&offset, idiom)) in placeholders.iter().zip(&self.ground_truth).enumerate() {
            let tag = instance_tag(idx, occurrence);
            let before = self.content[..offset].replace(IDIOM_PLACEHOLDER, UNK_TOKEN);
            let after =
                self.content[offset + IDIOM_PLACEHOLDER.len()..].replace(IDIOM_PLACEHOLDER, UNK_TOKEN);

            let options = match &self.candidates {
                Some(candidates) => {
                    let options = candidates
                        .get(occurrence)
                        .with_context(|| format!("No options for placeholder {}", occurrence))?;
                    ensure!(
                        options.len() == N_OPTIONS,
                        "Placeholder {} has {} options, expected {}",
                        occurrence,
                        options.len(),
                        N_OPTIONS
                    );
                    options.clone()
                }
                None => Vec::new(),
            };

            blanks.push(Blank {
                context: format!("{}{}{}", before, tag, after),
                tag,
                idiom: idiom.clone(),
                options,
            });
        }

        Ok(blanks)
    }
}

/// Counts of a preprocessing run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PreprocessStats {
    pub n_records: usize,
    pub n_instances: usize,

    /// Blanks of idioms outside of the vocabulary.
    pub n_unknown: usize,

    /// Blanks of idioms that the split does not use.
    pub n_filtered: usize,
}

/// Converts cloze records of a split to stored instances.
pub struct Preprocessor<'a> {
    split: Split,
    vocab: &'a IdiomVocab,
    tokenizer: &'a dyn Tokenizer,
    labelled: FnvHashSet<usize>,
    unlabelled: FnvHashSet<usize>,
}

impl<'a> Preprocessor<'a> {
    pub fn new(
        split: Split,
        vocab: &'a IdiomVocab,
        tokenizer: &'a dyn Tokenizer,
        labelled: FnvHashSet<usize>,
        unlabelled: FnvHashSet<usize>,
    ) -> Self {
        Preprocessor {
            split,
            vocab,
            tokenizer,
            labelled,
            unlabelled,
        }
    }

    /// Whether instances of the idiom are part of the split.
    ///
    /// Unlabelled idioms are only used for training.
    fn keeps(&self, idiom: usize) -> bool {
        self.labelled.contains(&idiom)
            || (self.split == Split::Train && self.unlabelled.contains(&idiom))
    }

    /// Tokenize the context of a blank around its tag.
    fn tokenize(&self, blank: &Blank) -> Result<(Vec<u32>, usize)> {
        let parts: Vec<&str> = blank.context.split(blank.tag.as_str()).collect();
        ensure!(
            parts.len() == 2,
            "Context of {} does not contain its tag exactly once",
            blank.tag
        );

        let mut tokens = self.tokenizer.tokenize(parts[0])?;
        let position = tokens.len();
        tokens.push(MASK_TOKEN.to_owned());
        tokens.extend(self.tokenizer.tokenize(parts[1])?);

        let input_ids = self.tokenizer.convert_tokens_to_ids(&tokens);
        let mask = self.tokenizer.special_ids().mask;
        ensure!(
            input_ids.iter().filter(|&&id| id == mask).count() == 1,
            "Context of {} contains a literal {}",
            blank.tag,
            MASK_TOKEN
        );

        Ok((input_ids, position))
    }

    /// Convert a blank, `None` when the split does not use its idiom.
    pub fn instance(&self, blank: &Blank, stats: &mut PreprocessStats) -> Result<Option<Instance>> {
        let idiom = match self.vocab.idx(&blank.idiom) {
            Some(idiom) => idiom,
            None => {
                stats.n_unknown += 1;
                return Ok(None);
            }
        };

        if !self.keeps(idiom) {
            stats.n_filtered += 1;
            return Ok(None);
        }

        let options = blank
            .options
            .iter()
            .map(|option| {
                self.vocab
                    .idx(option)
                    .with_context(|| format!("Option '{}' is not in the idiom vocabulary", option))
            })
            .collect::<Result<Vec<_>>>()?;
        let target = blank
            .options
            .iter()
            .position(|option| option == &blank.idiom)
            .map(|idx| idx as i64)
            .unwrap_or(IGNORE_INDEX);

        let (input_ids, position) = self.tokenize(blank)?;

        Ok(Some(Instance {
            tag: blank.tag.clone(),
            input_ids,
            position,
            idiom,
            target,
            options,
        }))
    }

    /// Convert the JSON line records of `read`.
    ///
    /// Records are numbered from `first_idx`. Returns the index of the
    /// next record.
    pub fn process<R>(
        &self,
        read: R,
        name: &str,
        first_idx: usize,
        writer: &mut StoreWriter,
        stats: &mut PreprocessStats,
    ) -> Result<usize>
    where
        R: BufRead,
    {
        let mut idx = first_idx;
        for (line_idx, line) in read.lines().enumerate() {
            let line = line.with_context(|| format!("Cannot read line {} of {}", line_idx + 1, name))?;
            if line.trim().is_empty() {
                continue;
            }

            let record: Record = serde_json::from_str(&line)
                .with_context(|| format!("Malformed record on line {} of {}", line_idx + 1, name))?;
            let blanks = record
                .blanks(idx)
                .with_context(|| format!("Malformed record on line {} of {}", line_idx + 1, name))?;
            for blank in blanks {
                let instance = self.instance(&blank, stats).with_context(|| {
                    format!("Cannot convert {} on line {} of {}", blank.tag, line_idx + 1, name)
                })?;
                if let Some(instance) = instance {
                    writer.push(&instance)?;
                    stats.n_instances += 1;
                }
            }

            stats.n_records += 1;
            idx += 1;
        }

        Ok(idx)
    }

    /// Convert record files into the instance store of the split.
    ///
    /// Records are numbered consecutively across files.
    pub fn run<P>(&self, records: &[P], store_dir: impl AsRef<Path>) -> Result<PreprocessStats>
    where
        P: AsRef<Path>,
    {
        let store_dir = store_dir.as_ref();
        if records.is_empty() {
            bail!("No record files were given");
        }

        let mut writer = StoreWriter::create(store_dir)?;
        let mut stats = PreprocessStats::default();
        let mut idx = 0;
        for path in records {
            let path = path.as_ref();
            let f = File::open(path)
                .with_context(|| format!("Cannot open records {}", path.display()))?;
            let progress = FileProgress::new(f).context("Cannot create progress bar")?;
            idx = self.process(
                BufReader::new(progress),
                &path.display().to_string(),
                idx,
                &mut writer,
                &mut stats,
            )?;
        }
        writer.finish()?;

        write_id_list(store_dir.join(self.split.labelled_file()), &self.labelled)?;
        write_id_list(store_dir.join(UNLABELLED_FILE), &self.unlabelled)?;

        info!(
            "{} split: {} instances from {} records, {} unknown and {} filtered idioms",
            self.split, stats.n_instances, stats.n_records, stats.n_unknown, stats.n_filtered
        );

        Ok(stats)
    }
}

/// Ids of the in-vocabulary idioms of a list.
pub fn idiom_ids<S>(vocab: &IdiomVocab, idioms: &[S]) -> FnvHashSet<usize>
where
    S: AsRef<str>,
{
    idioms
        .iter()
        .filter_map(|idiom| vocab.idx(idiom.as_ref()))
        .collect()
}
