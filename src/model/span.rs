use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};

use crate::vec_simd::max_assign;

/// Max-pool the hidden states of idiom spans.
///
/// `hidden` has shape `[batch, seq_len, hidden_size]`, `gather_index`
/// shape `[batch, span_width]`. Row *i* of the result is the elementwise
/// maximum of the hidden states at the sequence offsets in row *i* of
/// the gather index.
///
/// Panics when an offset lies outside of the sequence.
pub fn span_max_pool(hidden: ArrayView3<f32>, gather_index: ArrayView2<usize>) -> Array2<f32> {
    let (batch_size, seq_len, hidden_size) = hidden.dim();
    assert_eq!(
        gather_index.nrows(),
        batch_size,
        "Gather index and hidden states differ in batch size"
    );
    assert!(gather_index.ncols() > 0, "Cannot pool empty spans");

    // The SIMD kernels need contiguous rows.
    let hidden = hidden.as_standard_layout();

    let mut pooled = Array2::zeros((batch_size, hidden_size));
    for (idx, (mut pooled_row, offsets)) in pooled
        .outer_iter_mut()
        .zip(gather_index.outer_iter())
        .enumerate()
    {
        for (col, &offset) in offsets.iter().enumerate() {
            assert!(
                offset < seq_len,
                "Span offset {} outside of sequence of length {}",
                offset,
                seq_len
            );

            let state = hidden.slice(s![idx, offset, ..]);
            if col == 0 {
                pooled_row.assign(&state);
            } else {
                max_assign(pooled_row.view_mut(), state);
            }
        }
    }

    pooled
}

/// Pool the hidden states of every channel with its gather index.
pub fn pool_channels(hidden: &[Array3<f32>], gather_index: &[Array2<usize>]) -> Vec<Array2<f32>> {
    assert_eq!(
        hidden.len(),
        gather_index.len(),
        "One gather index per channel is required"
    );
    hidden
        .iter()
        .zip(gather_index)
        .map(|(hidden, index)| span_max_pool(hidden.view(), index.view()))
        .collect()
}

/// Position of the maximum of every row.
pub(crate) fn argmax_rows(values: ArrayView2<f32>) -> Vec<usize> {
    values
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |(best, max), (idx, &v)| {
                    if v > max {
                        (idx, v)
                    } else {
                        (best, max)
                    }
                })
                .0
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use ndarray::{arr2, Array3};

    use super::{argmax_rows, span_max_pool};
    use crate::collate::gather_index;

    fn hidden() -> Array3<f32> {
        Array3::from_shape_fn((2, 5, 3), |(n, s, h)| {
            ((n * 5 + s) as f32 - 4.).abs() * if h == 1 { -1. } else { 1. } + h as f32
        })
    }

    #[test]
    fn pools_span_maximum() {
        let hidden = hidden();
        let index = gather_index(&[(1, 2), (2, 3)]);
        let pooled = span_max_pool(hidden.view(), index.view());

        // Row 0 pools offsets 1, 2 and the default fill 2.
        assert_eq!(pooled.row(0).to_vec(), vec![3., -1., 5.]);

        // Row 1 pools offsets 2, 3, 4: |n*5+s-4| = 3, 4, 5.
        assert_eq!(pooled.row(1).to_vec(), vec![5., -2., 7.]);
    }

    #[test]
    fn pools_non_standard_layout() {
        let hidden = hidden();
        let permuted = hidden
            .view()
            .permuted_axes([1, 0, 2])
            .to_owned()
            .reversed_axes();
        let back = permuted.view().reversed_axes().permuted_axes([1, 0, 2]);
        let index = gather_index(&[(0, 1), (4, 1)]);
        assert_eq!(
            span_max_pool(back, index.view()),
            span_max_pool(hidden.view(), index.view())
        );
    }

    #[test]
    #[should_panic]
    fn offset_outside_sequence() {
        let hidden = hidden();
        let index = gather_index(&[(4, 2), (0, 1)]);
        span_max_pool(hidden.view(), index.view());
    }

    #[test]
    fn argmax() {
        let values = arr2(&[[0.1, 0.5, 0.2], [3., -1., 3.]]);
        assert_eq!(argmax_rows(values.view()), vec![1, 0]);
    }
}
