use std::io::{BufRead, Write};

use anyhow::{bail, Context, Result};
use finalfusion::prelude::VocabWrap;
use finalfusion::vocab::SimpleVocab as FiFuSimpleVocab;
use fnv::FnvHashMap;

use crate::vocab::{create_indices, VocabBuilder};

/// Idiom vocabulary.
///
/// Maps idiom surface forms to contiguous ids starting at zero. The
/// vocabulary is immutable once constructed.
#[derive(Clone, Debug)]
pub struct IdiomVocab {
    idioms: Vec<String>,
    index: FnvHashMap<String, usize>,
}

impl IdiomVocab {
    /// Construct a vocabulary, the id of an idiom is its position.
    ///
    /// Panics when `idioms` contains duplicates.
    pub fn new(idioms: Vec<String>) -> Self {
        let index = create_indices(&idioms);
        IdiomVocab { idioms, index }
    }

    /// Read a vocabulary with one idiom per line.
    pub fn read<R>(read: R) -> Result<Self>
    where
        R: BufRead,
    {
        let mut idioms = Vec::new();
        for (line_idx, line) in read.lines().enumerate() {
            let line = line.context("Cannot read idiom vocabulary")?;
            let idiom = line.trim();
            if idiom.is_empty() {
                bail!("Empty idiom on line {} of the vocabulary", line_idx + 1);
            }
            idioms.push(idiom.to_owned());
        }

        let mut seen = FnvHashMap::default();
        for (idx, idiom) in idioms.iter().enumerate() {
            if let Some(prev) = seen.insert(idiom.as_str(), idx) {
                bail!(
                    "Idiom '{}' occurs on lines {} and {} of the vocabulary",
                    idiom,
                    prev + 1,
                    idx + 1
                );
            }
        }

        Ok(Self::new(idioms))
    }

    /// Write the vocabulary, one idiom per line.
    pub fn write<W>(&self, write: &mut W) -> Result<()>
    where
        W: Write,
    {
        for idiom in &self.idioms {
            writeln!(write, "{}", idiom).context("Cannot write idiom vocabulary")?;
        }

        Ok(())
    }

    /// Get the id of an idiom.
    pub fn idx(&self, idiom: &str) -> Option<usize> {
        self.index.get(idiom).copied()
    }

    /// Get the idiom with the given id.
    pub fn idiom(&self, idx: usize) -> &str {
        &self.idioms[idx]
    }

    pub fn idioms(&self) -> &[String] {
        &self.idioms
    }

    pub fn len(&self) -> usize {
        self.idioms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idioms.is_empty()
    }
}

impl From<VocabBuilder<String>> for IdiomVocab {
    fn from(builder: VocabBuilder<String>) -> Self {
        IdiomVocab::new(
            builder
                .into_types::<String>()
                .into_iter()
                .map(|t| t.into_label())
                .collect(),
        )
    }
}

impl From<IdiomVocab> for VocabWrap {
    fn from(vocab: IdiomVocab) -> VocabWrap {
        FiFuSimpleVocab::new(vocab.idioms).into()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::IdiomVocab;
    use crate::vocab::{Cutoff, VocabBuilder};

    #[test]
    fn vocab_from_builder_is_frequency_sorted() {
        let mut builder: VocabBuilder<String> = VocabBuilder::new(Cutoff::MinCount(1));
        for idiom in &["画龙点睛", "马到成功", "马到成功", "一帆风顺", "马到成功", "一帆风顺"] {
            builder.count(*idiom);
        }

        let vocab: IdiomVocab = builder.into();
        assert_eq!(vocab.len(), 3);
        assert_eq!(vocab.idx("马到成功"), Some(0));
        assert_eq!(vocab.idx("一帆风顺"), Some(1));
        assert_eq!(vocab.idx("画龙点睛"), Some(2));
        assert_eq!(vocab.idx("对牛弹琴"), None);
        assert_eq!(vocab.idiom(1), "一帆风顺");
    }

    #[test]
    fn read_write_vocab() {
        let vocab = IdiomVocab::new(vec!["守株待兔".to_string(), "画蛇添足".to_string()]);
        let mut data = Vec::new();
        vocab.write(&mut data).unwrap();
        assert_eq!(String::from_utf8(data.clone()).unwrap(), "守株待兔\n画蛇添足\n");

        let read = IdiomVocab::read(Cursor::new(data)).unwrap();
        assert_eq!(read.idioms(), vocab.idioms());
    }

    #[test]
    fn read_rejects_duplicates_and_empty_lines() {
        assert!(IdiomVocab::read(Cursor::new("守株待兔\n守株待兔\n")).is_err());
        assert!(IdiomVocab::read(Cursor::new("守株待兔\n\n画蛇添足\n")).is_err());
    }
}
