use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read};
use std::path::Path;

use anyhow::{bail, ensure, Context, Result};
use fnv::{FnvHashMap, FnvHashSet};
use serde::{Deserialize, Serialize};

use crate::util::{N_FINE_EMOTIONS, N_SENTIMENTS};
use crate::vocab::IdiomVocab;

/// Affective annotation of an idiom.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Affection {
    pub coarse_emotion: i64,
    pub fine_emotion: i64,
    pub sentiment: i64,
    pub strength: i64,
}

impl Affection {
    fn validate(&self, idiom: &str) -> Result<()> {
        ensure!(
            self.coarse_emotion >= 0,
            "Negative coarse emotion {} for '{}'",
            self.coarse_emotion,
            idiom
        );
        ensure!(
            (0..N_FINE_EMOTIONS as i64).contains(&self.fine_emotion),
            "Fine emotion {} of '{}' is not in [0, {})",
            self.fine_emotion,
            idiom,
            N_FINE_EMOTIONS
        );
        ensure!(
            (0..N_SENTIMENTS as i64).contains(&self.sentiment),
            "Sentiment {} of '{}' is not in [0, {})",
            self.sentiment,
            idiom,
            N_SENTIMENTS
        );
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(Affection),
    Many(Vec<Affection>),
}

impl From<OneOrMany> for Vec<Affection> {
    fn from(records: OneOrMany) -> Self {
        match records {
            OneOrMany::One(affection) => vec![affection],
            OneOrMany::Many(affections) => affections,
        }
    }
}

/// Affective lexicon, idiom surface form to one or more annotations.
#[derive(Clone, Debug, Default)]
pub struct Lexicon {
    entries: FnvHashMap<String, Vec<Affection>>,
}

impl Lexicon {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let f = File::open(path)
            .with_context(|| format!("Cannot open lexicon {}", path.display()))?;
        Self::from_reader(BufReader::new(f))
            .with_context(|| format!("Cannot load lexicon {}", path.display()))
    }

    /// Parse and validate a JSON lexicon.
    pub fn from_reader<R>(read: R) -> Result<Self>
    where
        R: Read,
    {
        let raw: BTreeMap<String, OneOrMany> =
            serde_json::from_reader(read).context("Cannot parse lexicon")?;

        let mut entries = FnvHashMap::default();
        for (idiom, records) in raw {
            let records: Vec<Affection> = records.into();
            if records.is_empty() {
                bail!("Lexicon entry '{}' has no records", idiom);
            }
            for record in &records {
                record.validate(&idiom)?;
            }
            entries.insert(idiom, records);
        }

        Ok(Lexicon { entries })
    }

    /// The first annotation of an idiom.
    pub fn get(&self, idiom: &str) -> Option<&Affection> {
        self.entries.get(idiom).and_then(|records| records.first())
    }

    /// All annotations of an idiom.
    pub fn records(&self, idiom: &str) -> Option<&[Affection]> {
        self.entries.get(idiom).map(Vec::as_slice)
    }

    pub fn contains(&self, idiom: &str) -> bool {
        self.entries.contains_key(idiom)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Key the first annotation of every in-vocabulary idiom by its id.
    ///
    /// Idioms without a vocabulary id are dropped.
    pub fn by_id(&self, vocab: &IdiomVocab) -> FnvHashMap<usize, Affection> {
        self.entries
            .iter()
            .filter_map(|(idiom, records)| Some((vocab.idx(idiom)?, records[0])))
            .collect()
    }
}

/// Read a JSON array of idiom ids, e.g. the labelled ids of a split.
pub fn read_id_list(path: impl AsRef<Path>) -> Result<FnvHashSet<usize>> {
    let path = path.as_ref();
    let f = File::open(path).with_context(|| format!("Cannot open id list {}", path.display()))?;
    let ids: Vec<usize> = serde_json::from_reader(BufReader::new(f))
        .with_context(|| format!("Cannot parse id list {}", path.display()))?;
    Ok(ids.into_iter().collect())
}

/// Write idiom ids as a sorted JSON array.
pub fn write_id_list(path: impl AsRef<Path>, ids: &FnvHashSet<usize>) -> Result<()> {
    let path = path.as_ref();
    let mut ids: Vec<_> = ids.iter().copied().collect();
    ids.sort_unstable();
    let f =
        File::create(path).with_context(|| format!("Cannot create id list {}", path.display()))?;
    serde_json::to_writer(BufWriter::new(f), &ids)
        .with_context(|| format!("Cannot write id list {}", path.display()))
}

/// Read a JSON array of idiom surface forms.
pub fn read_idiom_list(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let f =
        File::open(path).with_context(|| format!("Cannot open idiom list {}", path.display()))?;
    serde_json::from_reader(BufReader::new(f))
        .with_context(|| format!("Cannot parse idiom list {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{Affection, Lexicon};
    use crate::vocab::IdiomVocab;

    static LEXICON: &str = r#"{
        "守株待兔": {"coarse_emotion": 2, "fine_emotion": 7, "sentiment": 2, "strength": 5},
        "画蛇添足": [
            {"coarse_emotion": 1, "fine_emotion": 3, "sentiment": 1, "strength": 3},
            {"coarse_emotion": 0, "fine_emotion": 0, "sentiment": 0, "strength": 1}
        ]
    }"#;

    #[test]
    fn single_and_multiple_records() {
        let lexicon = Lexicon::from_reader(Cursor::new(LEXICON)).unwrap();
        assert_eq!(lexicon.len(), 2);
        assert_eq!(
            lexicon.get("画蛇添足"),
            Some(&Affection {
                coarse_emotion: 1,
                fine_emotion: 3,
                sentiment: 1,
                strength: 3
            })
        );
        assert_eq!(lexicon.records("画蛇添足").unwrap().len(), 2);
        assert_eq!(lexicon.get("守株待兔").unwrap().fine_emotion, 7);
        assert!(lexicon.get("对牛弹琴").is_none());
    }

    #[test]
    fn affections_by_id() {
        let lexicon = Lexicon::from_reader(Cursor::new(LEXICON)).unwrap();
        let vocab = IdiomVocab::new(vec!["对牛弹琴".to_string(), "画蛇添足".to_string()]);
        let by_id = lexicon.by_id(&vocab);
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[&1].sentiment, 1);
    }

    #[test]
    fn invalid_records_are_rejected() {
        let out_of_range =
            r#"{"a": {"coarse_emotion": 0, "fine_emotion": 21, "sentiment": 0, "strength": 0}}"#;
        assert!(Lexicon::from_reader(Cursor::new(out_of_range)).is_err());

        let bad_sentiment =
            r#"{"a": {"coarse_emotion": 0, "fine_emotion": 2, "sentiment": 4, "strength": 0}}"#;
        assert!(Lexicon::from_reader(Cursor::new(bad_sentiment)).is_err());

        let unknown_field = r#"{"a": {"coarse_emotion": 0, "fine_emotion": 2, "sentiment": 1,
            "strength": 0, "polarity": 1}}"#;
        assert!(Lexicon::from_reader(Cursor::new(unknown_field)).is_err());

        assert!(Lexicon::from_reader(Cursor::new(r#"{"a": []}"#)).is_err());
    }
}
