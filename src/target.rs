use std::collections::BTreeMap;
use std::fmt;

use fnv::{FnvHashMap, FnvHashSet};
use ndarray::Array1;
use tracing::warn;

use crate::lexicon::Affection;
use crate::util::IGNORE_INDEX;

/// Number of columns of a target row in a batch.
pub const TARGET_WIDTH: usize = 5;

/// Supervision of one instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Target {
    /// Index in the enlarged candidate set or `IGNORE_INDEX`.
    pub candidate: i64,
    pub coarse_emotion: i64,
    pub fine_emotion: i64,
    pub sentiment: i64,
    pub strength: i64,
}

impl Target {
    /// A target without affective supervision.
    pub fn unannotated(candidate: i64) -> Self {
        Target {
            candidate,
            coarse_emotion: IGNORE_INDEX,
            fine_emotion: IGNORE_INDEX,
            sentiment: IGNORE_INDEX,
            strength: 0,
        }
    }

    pub fn to_row(&self) -> [i64; TARGET_WIDTH] {
        [
            self.candidate,
            self.coarse_emotion,
            self.fine_emotion,
            self.sentiment,
            self.strength,
        ]
    }

    #[cfg(test)]
    pub(crate) fn is_annotated(&self) -> bool {
        self.sentiment != IGNORE_INDEX
    }
}

/// Lookup tables used to resolve targets.
///
/// Annotations are used only for idioms that are labelled in the split.
pub struct TargetResolver<'a> {
    affections: &'a FnvHashMap<usize, Affection>,
    labelled: &'a FnvHashSet<usize>,
}

impl<'a> TargetResolver<'a> {
    pub fn new(
        affections: &'a FnvHashMap<usize, Affection>,
        labelled: &'a FnvHashSet<usize>,
    ) -> Self {
        TargetResolver {
            affections,
            labelled,
        }
    }

    /// The annotation of an idiom, when it is labelled.
    pub fn annotation(&self, idiom: usize) -> Option<&'a Affection> {
        if self.labelled.contains(&idiom) {
            self.affections.get(&idiom)
        } else {
            None
        }
    }

    /// Resolve the target of `idiom`, `candidate` is its index in the
    /// enlarged candidate set or `IGNORE_INDEX`.
    pub fn resolve(&self, idiom: usize, candidate: i64) -> Target {
        match self.annotation(idiom) {
            Some(affection) => Target {
                candidate,
                coarse_emotion: affection.coarse_emotion,
                fine_emotion: affection.fine_emotion,
                sentiment: affection.sentiment,
                strength: affection.strength,
            },
            None => Target::unannotated(candidate),
        }
    }
}

/// Frequency counter of class labels.
#[derive(Clone, Debug, Default)]
pub struct LabelCounter {
    counts: BTreeMap<i64, usize>,
}

impl LabelCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, label: i64) {
        *self.counts.entry(label).or_insert(0) += 1;
    }

    pub fn count(&self, label: i64) -> usize {
        self.counts.get(&label).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Class weights `count[c] / max_count` for classes `0..n_classes`.
    ///
    /// An empty counter gives uniform weights.
    pub fn class_weights(&self, n_classes: usize) -> Array1<f32> {
        let max_count = match self.counts.values().max() {
            Some(&max_count) => max_count,
            None => {
                warn!("No labels were counted, using uniform class weights");
                return Array1::ones(n_classes);
            }
        };

        (0..n_classes)
            .map(|class| self.count(class as i64) as f32 / max_count as f32)
            .collect()
    }
}

impl fmt::Display for LabelCounter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{")?;
        for (idx, (label, count)) in self.counts.iter().enumerate() {
            if idx != 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", label, count)?;
        }
        write!(f, "}}")
    }
}
