use ndarray::{Array2, Array3, Axis};
use rand::seq::{index, SliceRandom};
use rand::Rng;

use crate::assemble::{Assembled, Channel};
use crate::target::{Target, TARGET_WIDTH};
use crate::util::N_OPTIONS;

/// A single instance, ready to be collated.
#[derive(Clone, Debug)]
pub struct Example {
    /// Tag of the stored instance.
    pub qid: String,
    pub assembled: Assembled,
    pub options: Vec<usize>,
    pub target: Target,
}

/// Padded tensors of a batch of examples.
///
/// Channel-wise tensors are stacked along the leading axis, so their
/// shape is `[channels, batch, seq_len]`.
#[derive(Clone, Debug)]
pub struct Batch {
    pub input_ids: Array3<u32>,
    pub token_type_ids: Array3<u32>,
    pub attention_mask: Array3<u32>,

    /// Per channel `[batch, span_width]` sequence offsets of the idiom spans.
    pub gather_index: Vec<Array2<usize>>,

    /// `[batch, channels]` span starts.
    pub positions: Array2<usize>,

    /// `[batch, 7]` option idiom ids.
    pub option_ids: Array2<usize>,

    /// `[batch, 5]` target rows.
    pub targets: Array2<i64>,

    pub qids: Vec<String>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.qids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.qids.is_empty()
    }

    pub fn n_channels(&self) -> usize {
        self.input_ids.len_of(Axis(0))
    }

    /// Target column, e.g. `1` for coarse emotions.
    pub fn target_column(&self, column: usize) -> Vec<i64> {
        self.targets.column(column).to_vec()
    }
}

/// Build a gather index from `(span_start, span_width)` pairs.
///
/// Every row starts as `0..max_width`, the first `span_width` entries
/// are replaced by `span_start..span_start + span_width`. The default
/// fill is kept in columns beyond a span's width.
pub fn gather_index(spans: &[(usize, usize)]) -> Array2<usize> {
    let width_max = spans.iter().map(|&(_, width)| width).max().unwrap_or(0);
    let mut index = Array2::from_shape_fn((spans.len(), width_max), |(_, col)| col);
    for (mut row, &(start, width)) in index.outer_iter_mut().zip(spans) {
        for (col, offset) in row.iter_mut().take(width).enumerate() {
            *offset = start + col;
        }
    }
    index
}

/// Ensure that an instance has exactly seven options.
///
/// Stored option lists are passed through. Instances without options get
/// seven distinct random idioms from `0..len_idiom_vocab`. If the gold
/// idiom was not drawn it replaces the last draw, after which the options
/// are shuffled.
pub fn fill_options<R>(
    options: &[usize],
    idiom: usize,
    len_idiom_vocab: usize,
    rng: &mut R,
) -> Vec<usize>
where
    R: Rng,
{
    if !options.is_empty() {
        assert_eq!(
            options.len(),
            N_OPTIONS,
            "An instance must have zero or {} options",
            N_OPTIONS
        );
        return options.to_owned();
    }

    assert!(
        len_idiom_vocab >= N_OPTIONS,
        "Cannot sample {} options from {} idioms",
        N_OPTIONS,
        len_idiom_vocab
    );
    let mut sampled = index::sample(rng, len_idiom_vocab, N_OPTIONS).into_vec();
    if !sampled.contains(&idiom) {
        sampled[N_OPTIONS - 1] = idiom;
    }
    sampled.shuffle(rng);
    sampled
}

fn padded_channel<F>(examples: &[Example], channel: usize, seq_len: usize, ids: F) -> Array2<u32>
where
    F: Fn(&Channel) -> &[u32],
{
    let mut padded = Array2::zeros((examples.len(), seq_len));
    for (mut row, example) in padded.outer_iter_mut().zip(examples) {
        let values = ids(&example.assembled.channels[channel]);
        for (slot, &value) in row.iter_mut().zip(values) {
            *slot = value;
        }
    }
    padded
}

fn stack_channels(channels: Vec<Array2<u32>>) -> Array3<u32> {
    let (n, s) = channels[0].dim();
    let mut stacked = Array3::zeros((channels.len(), n, s));
    for (mut slot, channel) in stacked.outer_iter_mut().zip(channels) {
        slot.assign(&channel);
    }
    stacked
}

/// Collate examples into a batch.
///
/// Sequences are right-padded with zeros to the longest sequence of the
/// batch.
///
/// Panics on an empty batch, on examples with different channel counts
/// and on examples that do not have seven options.
pub fn collate(examples: Vec<Example>) -> Batch {
    assert!(!examples.is_empty(), "Cannot collate an empty batch");

    let n_channels = examples[0].assembled.channels.len();
    assert!(
        examples
            .iter()
            .all(|example| example.assembled.channels.len() == n_channels),
        "Examples differ in their number of channels"
    );

    let seq_len = examples
        .iter()
        .flat_map(|example| example.assembled.channels.iter().map(|c| c.len()))
        .max()
        .unwrap_or(0);

    let mut input_ids = Vec::with_capacity(n_channels);
    let mut token_type_ids = Vec::with_capacity(n_channels);
    let mut attention_mask = Vec::with_capacity(n_channels);
    let mut gather_indices = Vec::with_capacity(n_channels);
    for channel in 0..n_channels {
        input_ids.push(padded_channel(&examples, channel, seq_len, |c| {
            c.input_ids.as_slice()
        }));
        token_type_ids.push(padded_channel(&examples, channel, seq_len, |c| {
            c.token_type_ids.as_slice()
        }));
        attention_mask.push(padded_channel(&examples, channel, seq_len, |c| {
            c.attention_mask.as_slice()
        }));

        let spans: Vec<_> = examples
            .iter()
            .map(|example| {
                (
                    example.assembled.channels[channel].span_start,
                    example.assembled.span_len,
                )
            })
            .collect();
        gather_indices.push(gather_index(&spans));
    }

    let positions = Array2::from_shape_fn((examples.len(), n_channels), |(row, channel)| {
        examples[row].assembled.channels[channel].span_start
    });

    let mut option_ids = Array2::zeros((examples.len(), N_OPTIONS));
    let mut targets = Array2::zeros((examples.len(), TARGET_WIDTH));
    for (idx, example) in examples.iter().enumerate() {
        assert_eq!(
            example.options.len(),
            N_OPTIONS,
            "Instance {} does not have {} options",
            example.qid,
            N_OPTIONS
        );
        option_ids
            .row_mut(idx)
            .assign(&ndarray::aview1(example.options.as_slice()));
        targets
            .row_mut(idx)
            .assign(&ndarray::aview1(&example.target.to_row()[..]));
    }

    Batch {
        input_ids: stack_channels(input_ids),
        token_type_ids: stack_channels(token_type_ids),
        attention_mask: stack_channels(attention_mask),
        gather_index: gather_indices,
        positions,
        option_ids,
        targets,
        qids: examples.into_iter().map(|example| example.qid).collect(),
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr2, Axis};

    use super::{collate, fill_options, gather_index, Example};
    use crate::assemble::assemble;
    use crate::config::DatasetVariant;
    use crate::target::Target;
    use crate::tokenizer::SpecialIds;
    use crate::util::{seeded_rng, N_OPTIONS};

    const SPECIAL: SpecialIds = SpecialIds {
        cls: 101,
        sep: 102,
        mask: 103,
        pad: 0,
    };

    fn example(qid: &str, context: &[u32], idiom: &[u32], masked: bool) -> Example {
        let variant = DatasetVariant {
            use_context: true,
            masked,
            use_unlabeled: false,
        };
        Example {
            qid: qid.to_string(),
            assembled: assemble(context, idiom, SPECIAL, variant, 16),
            options: (10..17).collect(),
            target: Target::unannotated(3),
        }
    }

    #[test]
    fn gather_index_keeps_default_fill() {
        let (s0, s1) = (4, 2);
        let index = gather_index(&[(s0, 2), (s1, 3)]);
        assert_eq!(index, arr2(&[[s0, s0 + 1, 2], [s1, s1 + 1, s1 + 2]]));
    }

    #[test]
    fn gather_index_rows_cover_spans() {
        let spans = [(7, 1), (0, 4), (3, 2), (12, 4)];
        let index = gather_index(&spans);
        assert_eq!(index.dim(), (4, 4));
        for (row, &(start, width)) in index.outer_iter().zip(&spans) {
            for col in 0..4 {
                let expected = if col < width { start + col } else { col };
                assert_eq!(row[col], expected);
            }
        }
    }

    #[test]
    fn collate_pads_and_stacks() {
        let batch = collate(vec![
            example("a", &[5, 103, 6], &[40, 41], false),
            example("b", &[5, 6, 7, 103], &[40, 41, 42], false),
        ]);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.n_channels(), 1);
        assert_eq!(batch.input_ids.dim(), (1, 2, 8));
        assert_eq!(
            batch.input_ids.index_axis(Axis(0), 0),
            arr2(&[
                [101, 5, 40, 41, 6, 102, 0, 0],
                [101, 5, 6, 7, 40, 41, 42, 102]
            ])
        );
        assert_eq!(
            batch.attention_mask.index_axis(Axis(0), 0),
            arr2(&[[1, 1, 1, 1, 1, 1, 0, 0], [1, 1, 1, 1, 1, 1, 1, 1]])
        );
        assert_eq!(batch.gather_index.len(), 1);
        assert_eq!(batch.gather_index[0], arr2(&[[2, 3, 2], [4, 5, 6]]));
        assert_eq!(batch.positions, arr2(&[[2], [4]]));
        assert_eq!(batch.targets.row(1).to_vec(), vec![3, -100, -100, -100, 0]);
        assert_eq!(batch.option_ids.row(0).to_vec(), (10..17).collect::<Vec<_>>());
        assert_eq!(batch.qids, vec!["a", "b"]);
    }

    #[test]
    fn collate_masked_channels() {
        let batch = collate(vec![
            example("a", &[5, 103, 6], &[40, 41], true),
            example("b", &[103, 6], &[40], true),
        ]);
        assert_eq!(batch.input_ids.dim(), (2, 2, 6));
        assert_eq!(batch.gather_index.len(), 2);
        assert_eq!(batch.gather_index[1], arr2(&[[2, 3], [1, 1]]));
        assert_eq!(
            batch.input_ids.index_axis(Axis(0), 1),
            arr2(&[[101, 5, 103, 103, 6, 102], [101, 103, 6, 102, 0, 0]])
        );
    }

    #[test]
    #[should_panic]
    fn collate_empty_batch() {
        collate(Vec::new());
    }

    #[test]
    #[should_panic]
    fn collate_ragged_options() {
        let mut ex = example("a", &[103], &[40], false);
        ex.options.pop();
        collate(vec![ex]);
    }

    #[test]
    fn sampled_options_contain_idiom_once() {
        let mut rng = seeded_rng(13, 0);
        for idiom in 0..30 {
            let options = fill_options(&[], idiom, 30, &mut rng);
            assert_eq!(options.len(), N_OPTIONS);
            assert_eq!(options.iter().filter(|&&o| o == idiom).count(), 1);
            let mut sorted = options.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), N_OPTIONS);
        }
    }

    #[test]
    fn stored_options_pass_through() {
        let mut rng = seeded_rng(13, 0);
        let stored: Vec<usize> = (20..27).collect();
        assert_eq!(fill_options(&stored, 22, 30, &mut rng), stored);
    }

    #[test]
    #[should_panic]
    fn stored_options_must_have_seven_entries() {
        let mut rng = seeded_rng(13, 0);
        fill_options(&[1, 2, 3], 2, 30, &mut rng);
    }
}
