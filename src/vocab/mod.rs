mod candidates;
pub use self::candidates::EnlargedCandidates;

mod idiom;
pub use self::idiom::IdiomVocab;

use std::cmp::Reverse;
use std::hash::Hash;

use fnv::FnvHashMap;
use serde::Serialize;
use superslice::Ext;

pub type CountedIdiom = CountedType<String>;

/// A vocabulary item with its frequency.
///
/// Ordering is by count first, then by label.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct CountedType<T> {
    count: usize,
    label: T,
}

impl<T> CountedType<T> {
    /// Construct a new type.
    pub fn new(label: T, count: usize) -> Self {
        CountedType { label, count }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn label(&self) -> &T {
        &self.label
    }

    pub fn into_label(self) -> T {
        self.label
    }
}

/// Builder that counts idiom occurrences.
///
/// Items are counted with the `count` method. The vocabulary is
/// constructed through `From<VocabBuilder<_>>`, which applies the
/// builder's cutoff.
pub struct VocabBuilder<T> {
    cutoff: Cutoff,
    items: FnvHashMap<T, usize>,
    n_items: usize,
}

impl<T> VocabBuilder<T>
where
    T: Hash + Eq,
{
    pub fn new(cutoff: Cutoff) -> Self {
        VocabBuilder {
            cutoff,
            items: FnvHashMap::default(),
            n_items: 0,
        }
    }

    pub fn count<S>(&mut self, item: S)
    where
        S: Into<T>,
    {
        self.n_items += 1;
        *self.items.entry(item.into()).or_insert(0) += 1;
    }

    /// Number of counted occurrences, including items that will be cut off.
    pub fn n_items(&self) -> usize {
        self.n_items
    }

    /// Number of distinct counted items.
    pub fn n_types(&self) -> usize {
        self.items.len()
    }

    /// Apply the cutoff and return the surviving items, most frequent first.
    pub(crate) fn into_types<S>(self) -> Vec<CountedType<S>>
    where
        T: Into<S>,
        S: Hash + Eq + Clone + Ord,
    {
        self.cutoff.filter(self.items)
    }
}

/// Cutoff to determine vocabulary size.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "type", content = "value")]
pub enum Cutoff {
    /// Cutoff based on minimum frequency, items appearing less than
    /// `min_count` times are discarded.
    MinCount(usize),
    /// Cutoff based on a target size, up to `target_size` items are kept
    /// in the vocabulary. If the item at `target_size+1` appears `n` times,
    /// all items with frequency `n` and smaller are discarded.
    TargetSize(usize),
}

impl Cutoff {
    pub(crate) fn filter<T, S>(
        &self,
        items: impl IntoIterator<Item = (T, usize)>,
    ) -> Vec<CountedType<S>>
    where
        T: Hash + Eq + Into<S>,
        S: Hash + Eq + Clone + Ord,
    {
        let mut types: Vec<_> = items
            .into_iter()
            .map(|(item, count)| CountedType::new(item.into(), count))
            .collect();
        types.sort_unstable_by(|t1, t2| t2.cmp(t1));

        match *self {
            Cutoff::MinCount(min_count) => {
                let keep = types.iter().take_while(|t| t.count >= min_count).count();
                types.truncate(keep);
            }
            Cutoff::TargetSize(target_size) if target_size < types.len() => {
                let cutoff_idx = types
                    .lower_bound_by_key(&Reverse(types[target_size].count), |t| Reverse(t.count));
                types.truncate(cutoff_idx);
            }
            Cutoff::TargetSize(_) => (),
        }

        types
    }
}

/// Create a label to index lookup.
pub(crate) fn create_indices<S>(labels: &[S]) -> FnvHashMap<S, usize>
where
    S: Hash + Eq + Clone,
{
    let index: FnvHashMap<_, _> = labels
        .iter()
        .enumerate()
        .map(|(idx, label)| (label.clone(), idx))
        .collect();

    // Invariant: every label has its own index.
    assert_eq!(labels.len(), index.len(), "Vocabulary contains duplicates");

    index
}
