use ndarray::{Array2, ArrayView2, ArrayViewMut2, Axis};

use crate::loss::softmax;
use crate::vec_simd::scaled_add;
use crate::vocab::EnlargedCandidates;

/// Soft lookup of blank states in the candidate idiom embeddings.
///
/// With the blank state *b* and the candidate embeddings *E*:
///
/// * *logits = bEᵀ*
/// * *state = softmax(logits) E*
///
/// so that the state is a differentiable mixture of all candidates.
#[derive(Clone, Debug)]
pub struct SoftLookup {
    /// Candidate embeddings `[candidates, hidden]`.
    pub embeddings: Array2<f32>,

    /// `[batch, candidates]`
    pub logits: Array2<f32>,

    /// Softmax of the logits.
    pub probs: Array2<f32>,

    /// `[batch, hidden]`
    pub state: Array2<f32>,
}

impl SoftLookup {
    pub fn forward(
        blank: ArrayView2<f32>,
        table: ArrayView2<f32>,
        candidates: &EnlargedCandidates,
    ) -> Self {
        assert!(!candidates.is_empty(), "Cannot attend over zero candidates");
        let embeddings = table.select(Axis(0), candidates.ids());
        let logits = blank.dot(&embeddings.t());
        let probs = softmax(logits.view());
        let state = probs.dot(&embeddings);

        SoftLookup {
            embeddings,
            logits,
            probs,
            state,
        }
    }

    /// Accumulate the gradient of the embedding table in `grad_table`.
    ///
    /// `grad_logits` is the gradient of the logits of losses that use them
    /// directly, `grad_state` the gradient of the state. The blank states
    /// are constant, their gradient is not computed.
    pub fn backward(
        &self,
        blank: ArrayView2<f32>,
        grad_state: ArrayView2<f32>,
        grad_logits: Option<ArrayView2<f32>>,
        candidates: &EnlargedCandidates,
        grad_table: ArrayViewMut2<f32>,
    ) {
        // state = P E
        let mut grad_embeddings = self.probs.t().dot(&grad_state);
        let grad_probs = grad_state.dot(&self.embeddings.t());

        // P = softmax(logits), ∂l/∂x_j = p_j (∂l/∂p_j - Σ_k p_k ∂l/∂p_k)
        let mut grad_total = grad_probs;
        for (mut grad_row, probs_row) in grad_total.outer_iter_mut().zip(self.probs.outer_iter()) {
            let weighted = grad_row.dot(&probs_row);
            grad_row.zip_mut_with(&probs_row, |g, &p| *g = p * (*g - weighted));
        }
        if let Some(grad_logits) = grad_logits {
            grad_total += &grad_logits;
        }

        // logits = b Eᵀ
        grad_embeddings += &grad_total.t().dot(&blank);

        scatter_rows(grad_table, grad_embeddings.view(), candidates.ids());
    }
}

/// Add row *k* of `rows` to row `ids[k]` of `table`.
fn scatter_rows(mut table: ArrayViewMut2<f32>, rows: ArrayView2<f32>, ids: &[usize]) {
    for (row, &id) in rows.outer_iter().zip(ids) {
        scaled_add(table.row_mut(id), row, 1.);
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{arr2, Array2};
    use ndarray_rand::rand_distr::Normal;
    use ndarray_rand::RandomExt;

    use super::SoftLookup;
    use crate::util::{close, seeded_rng};
    use crate::vocab::EnlargedCandidates;

    #[test]
    fn state_mixes_candidates() {
        let table = arr2(&[[1., 0.], [0., 1.], [5., 5.], [-1., 0.]]);
        let candidates = EnlargedCandidates::new(vec![0, 1, 3]);
        let blank = arr2(&[[0., 0.], [100., 0.]]);
        let lookup = SoftLookup::forward(blank.view(), table.view(), &candidates);

        assert_eq!(lookup.logits.dim(), (2, 3));
        assert_eq!(lookup.logits.row(1).to_vec(), vec![100., 0., -100.]);

        // Uniform attention for a zero blank.
        assert!(close(lookup.state[(0, 0)], 0., 1e-6));
        assert!(close(lookup.state[(0, 1)], 1. / 3., 1e-6));

        // Peaked attention selects the first candidate.
        assert!(close(lookup.state[(1, 0)], 1., 1e-6));
        assert!(close(lookup.state[(1, 1)], 0., 1e-6));
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let mut rng = seeded_rng(5, 0);
        let dist = Normal::new(0f32, 0.5).unwrap();
        let table = Array2::random_using((6, 3), dist, &mut rng);
        let blank = Array2::random_using((2, 3), dist, &mut rng);
        let state_probe = Array2::random_using((2, 3), dist, &mut rng);
        let logits_probe = Array2::random_using((2, 4), dist, &mut rng);
        let candidates = EnlargedCandidates::new(vec![4, 0, 2, 5]);

        // f(E) = Σ state_probe ⊙ state + Σ logits_probe ⊙ logits
        let f = |table: &Array2<f32>| {
            let lookup = SoftLookup::forward(blank.view(), table.view(), &candidates);
            (&lookup.state * &state_probe).sum() + (&lookup.logits * &logits_probe).sum()
        };

        let lookup = SoftLookup::forward(blank.view(), table.view(), &candidates);
        let mut grad = Array2::zeros(table.dim());
        lookup.backward(
            blank.view(),
            state_probe.view(),
            Some(logits_probe.view()),
            &candidates,
            grad.view_mut(),
        );

        // Rows outside of the candidates get no gradient.
        assert!(grad.row(1).iter().chain(grad.row(3).iter()).all(|&g| g == 0.));

        let eps = 1e-3;
        for ((i, j), &analytic) in grad.indexed_iter() {
            let mut plus = table.clone();
            plus[(i, j)] += eps;
            let mut minus = table.clone();
            minus[(i, j)] -= eps;
            let numeric = (f(&plus) - f(&minus)) / (2. * eps);
            assert!(
                close(analytic, numeric, 1e-2),
                "({}, {}): {} != {}",
                i,
                j,
                analytic,
                numeric
            );
        }
    }
}
