use std::cmp::Ordering;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Result};
use fnv::{FnvHashMap, FnvHashSet};
use ndarray::{ArrayView1, ArrayView2, Axis};

use crate::vec_simd::{dot, l2_normalize};
use crate::vocab::IdiomVocab;

/// Neighbourhood sizes at which synonym recall is reported.
pub const RECALL_KS: [usize; 4] = [1, 3, 5, 10];

/// Synonym dictionary: idiom to its synonymous idioms.
#[derive(Clone, Debug, Default)]
pub struct Synonyms {
    entries: FnvHashMap<String, FnvHashSet<String>>,
}

impl Synonyms {
    /// Read a JSON object mapping idioms to arrays of synonyms.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let f = File::open(path)
            .with_context(|| format!("Cannot open synonym dictionary {}", path.display()))?;
        Self::from_reader(BufReader::new(f))
            .with_context(|| format!("Cannot parse synonym dictionary {}", path.display()))
    }

    pub fn from_reader<R>(read: R) -> Result<Self>
    where
        R: Read,
    {
        let entries: FnvHashMap<String, Vec<String>> = serde_json::from_reader(read)?;
        Ok(Synonyms {
            entries: entries
                .into_iter()
                .map(|(idiom, synonyms)| (idiom, synonyms.into_iter().collect()))
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Synonym hits among the nearest neighbours of idiom embeddings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SynonymRecall {
    /// Dictionary entries whose idiom and at least one synonym have an
    /// embedding.
    pub n_queries: usize,

    /// Dictionary entries.
    pub n_entries: usize,

    /// Synonyms among the `RECALL_KS[i]` nearest neighbours by cosine
    /// similarity, summed over the queries.
    pub cosine: [usize; 4],

    /// The same under euclidean distance.
    pub l2: [usize; 4],
}

impl fmt::Display for SynonymRecall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} of {} synonym entries with embeddings, recall@k",
            self.n_queries, self.n_entries
        )?;
        for (i, k) in RECALL_KS.iter().enumerate() {
            write!(f, " {}: {}/{}", k, self.cosine[i], self.l2[i])?;
        }
        write!(f, " (cosine/l2)")
    }
}

/// Count the synonyms among the nearest neighbours of every dictionary
/// idiom.
///
/// Row `i` of `embeddings` is the embedding of idiom `i` of the vocabulary,
/// idioms without a row are treated as unknown. The query idiom itself is
/// never counted as its own neighbour.
pub fn synonym_recall(
    vocab: &IdiomVocab,
    embeddings: ArrayView2<f32>,
    synonyms: &Synonyms,
) -> SynonymRecall {
    let n_rows = embeddings.nrows();
    let lookup = |idiom: &str| vocab.idx(idiom).filter(|&idx| idx < n_rows);

    let mut normalized = embeddings.to_owned();
    for row in normalized.outer_iter_mut() {
        l2_normalize(row);
    }

    let mut recall = SynonymRecall {
        n_queries: 0,
        n_entries: synonyms.len(),
        cosine: [0; 4],
        l2: [0; 4],
    };

    for (idiom, idiom_synonyms) in &synonyms.entries {
        let query = match lookup(idiom) {
            Some(query) => query,
            None => continue,
        };
        let synonym_ids: FnvHashSet<usize> = idiom_synonyms
            .iter()
            .filter_map(|synonym| lookup(synonym))
            .collect();
        if synonym_ids.is_empty() {
            continue;
        }
        recall.n_queries += 1;

        // Higher is nearer for both orderings.
        let similarities = normalized.dot(&normalized.index_axis(Axis(0), query));
        let neg_distances: Vec<f32> = embeddings
            .outer_iter()
            .map(|row| -squared_distance(row, embeddings.index_axis(Axis(0), query)))
            .collect();

        count_hits(&mut recall.cosine, similarities.as_slice().unwrap_or(&[]), query, &synonym_ids);
        count_hits(&mut recall.l2, &neg_distances, query, &synonym_ids);
    }

    recall
}

fn squared_distance(u: ArrayView1<f32>, v: ArrayView1<f32>) -> f32 {
    let diff = &u - &v;
    dot(diff.view(), diff.view())
}

fn count_hits(hits: &mut [usize; 4], scores: &[f32], query: usize, synonyms: &FnvHashSet<usize>) {
    let mut neighbours: Vec<usize> = (0..scores.len()).filter(|&idx| idx != query).collect();
    // Stable, ties keep the vocabulary order.
    neighbours.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(Ordering::Equal)
    });

    for (hit, &k) in hits.iter_mut().zip(&RECALL_KS) {
        *hit += neighbours
            .iter()
            .take(k)
            .filter(|idx| synonyms.contains(idx))
            .count();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use ndarray::arr2;

    use super::{synonym_recall, SynonymRecall, Synonyms};
    use crate::vocab::IdiomVocab;

    fn vocab() -> IdiomVocab {
        IdiomVocab::new(
            ["守株待兔", "刻舟求剑", "画蛇添足", "多此一举", "对牛弹琴"]
                .iter()
                .map(|idiom| idiom.to_string())
                .collect(),
        )
    }

    #[test]
    fn cosine_and_euclidean_neighbours_differ() {
        // Seen from 守株待兔: 刻舟求剑 points the same way but is far away,
        // 画蛇添足 is close but at 45 degrees. 对牛弹琴 has no row.
        let embeddings = arr2(&[[1., 0.], [10., 1.], [0.5, 0.5], [-1., 0.]]);
        let synonyms = Synonyms::from_reader(Cursor::new(
            r#"{
                "守株待兔": ["刻舟求剑", "对牛弹琴"],
                "对牛弹琴": ["守株待兔"],
                "画蛇添足": ["不存在"]
            }"#,
        ))
        .unwrap();

        let recall = synonym_recall(&vocab(), embeddings.view(), &synonyms);
        assert_eq!(
            recall,
            SynonymRecall {
                n_queries: 1,
                n_entries: 3,
                cosine: [1, 1, 1, 1],
                l2: [0, 0, 1, 1],
            }
        );
    }

    #[test]
    fn query_is_not_its_own_neighbour() {
        let embeddings = arr2(&[[1., 0.], [1., 0.], [0., 1.]]);
        let synonyms =
            Synonyms::from_reader(Cursor::new(r#"{"刻舟求剑": ["画蛇添足"]}"#)).unwrap();
        let recall = synonym_recall(&vocab(), embeddings.view(), &synonyms);
        assert_eq!(recall.cosine, [0, 1, 1, 1]);
        assert_eq!(recall.l2, [0, 1, 1, 1]);
    }

    #[test]
    fn malformed_dictionary() {
        assert!(Synonyms::from_reader(Cursor::new(r#"{"守株待兔": "刻舟求剑"}"#)).is_err());
    }
}
