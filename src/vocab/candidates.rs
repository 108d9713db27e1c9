use std::convert::TryFrom;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use fnv::{FnvHashMap, FnvHashSet};
use serde::{Deserialize, Serialize};

use crate::util::IGNORE_INDEX;
use crate::vocab::create_indices;

/// Ordered subset of the idiom vocabulary that the latent vocabulary
/// scorer attends over.
///
/// The set is computed once from the training split and reused for
/// every other split of a run. The target index of an idiom is its
/// position in the ordered sequence.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct EnlargedCandidates {
    ids: Vec<usize>,
    index: FnvHashMap<usize, usize>,
}

impl EnlargedCandidates {
    /// Construct from idiom ids in candidate order.
    ///
    /// Panics when an id occurs more than once.
    pub fn new(ids: Vec<usize>) -> Self {
        let index = create_indices(&ids);
        EnlargedCandidates { ids, index }
    }

    /// All ids in `0..len_idiom_vocab` for which `is_member` holds.
    pub fn from_members<F>(len_idiom_vocab: usize, is_member: F) -> Self
    where
        F: Fn(usize) -> bool,
    {
        Self::new((0..len_idiom_vocab).filter(|&id| is_member(id)).collect())
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let f = File::open(path)
            .with_context(|| format!("Cannot open candidate file {}", path.display()))?;
        serde_json::from_reader(BufReader::new(f))
            .with_context(|| format!("Cannot parse candidate file {}", path.display()))
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let f = File::create(path)
            .with_context(|| format!("Cannot create candidate file {}", path.display()))?;
        serde_json::to_writer(BufWriter::new(f), self)
            .with_context(|| format!("Cannot write candidate file {}", path.display()))
    }

    /// Position of an idiom in the candidate set.
    pub fn index_of(&self, idiom: usize) -> Option<usize> {
        self.index.get(&idiom).copied()
    }

    /// Supervision target of an idiom, `IGNORE_INDEX` for non-candidates.
    pub fn target_index(&self, idiom: usize) -> i64 {
        self.index_of(idiom)
            .map(|idx| idx as i64)
            .unwrap_or(IGNORE_INDEX)
    }

    /// The idiom at a candidate position.
    pub fn id_at(&self, index: usize) -> usize {
        self.ids[index]
    }

    pub fn ids(&self) -> &[usize] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl TryFrom<Vec<usize>> for EnlargedCandidates {
    type Error = String;

    fn try_from(ids: Vec<usize>) -> Result<Self, Self::Error> {
        let mut seen = FnvHashSet::default();
        if let Some(id) = ids.iter().find(|&&id| !seen.insert(id)) {
            return Err(format!("idiom {} is a candidate more than once", id));
        }
        Ok(EnlargedCandidates::new(ids))
    }
}

impl From<EnlargedCandidates> for Vec<usize> {
    fn from(candidates: EnlargedCandidates) -> Self {
        candidates.ids
    }
}
