use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

use crate::util::IGNORE_INDEX;

/// Row-wise softmax.
///
/// The row maximum is subtracted before exponentiation, so that large
/// logits do not overflow.
pub fn softmax(logits: ArrayView2<f32>) -> Array2<f32> {
    let mut probs = logits.to_owned();
    for mut row in probs.outer_iter_mut() {
        let max = row.fold(f32::NEG_INFINITY, |max, &v| max.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|v| v / sum);
    }
    probs
}

/// Losses and gradient of a (weighted) cross-entropy.
#[derive(Clone, Debug)]
pub struct CrossEntropy {
    /// Per-example losses, zero for ignored examples.
    pub losses: Array1<f32>,

    /// Examples whose label is not ignored.
    pub valid: Vec<bool>,

    /// Gradient of the mean loss over valid examples with respect to the
    /// logits.
    pub grad: Array2<f32>,
}

impl CrossEntropy {
    pub fn n_valid(&self) -> usize {
        self.valid.iter().filter(|&&valid| valid).count()
    }

    /// Mean loss over valid examples, zero when every label is ignored.
    pub fn mean(&self) -> f32 {
        match self.n_valid() {
            0 => 0.,
            n => self.losses.sum() / n as f32,
        }
    }
}

/// Cross-entropy of `logits` against `targets`.
///
/// The loss of example *i* with label *y* is *-w_y log softmax(x_i)_y*,
/// where *w* are the class weights (all ones when absent). Examples
/// labelled `IGNORE_INDEX` have a zero loss and gradient. The gradient
/// is that of the plain mean of the per-example losses over the valid
/// examples:
///
/// *∂/∂x_ij = w_y (softmax(x_i)_j - [j = y]) / n_valid*
///
/// Panics when a label is neither ignored nor a valid class.
pub fn cross_entropy(
    logits: ArrayView2<f32>,
    targets: &[i64],
    weights: Option<ArrayView1<f32>>,
) -> CrossEntropy {
    let (n, n_classes) = logits.dim();
    assert_eq!(n, targets.len(), "Number of logits and targets differ");
    if let Some(weights) = weights {
        assert_eq!(weights.len(), n_classes, "One weight per class is required");
    }

    let valid: Vec<bool> = targets
        .iter()
        .map(|&target| {
            assert!(
                target == IGNORE_INDEX || (target >= 0 && (target as usize) < n_classes),
                "Label {} outside of {} classes",
                target,
                n_classes
            );
            target != IGNORE_INDEX
        })
        .collect();
    let n_valid = valid.iter().filter(|&&valid| valid).count();

    let mut losses = Array1::zeros(n);
    let mut grad = softmax(logits);
    for (idx, mut row) in grad.outer_iter_mut().enumerate() {
        if !valid[idx] {
            row.fill(0.);
            continue;
        }

        let label = targets[idx] as usize;
        let weight = weights.map(|w| w[label]).unwrap_or(1.);

        // Probabilities underflow for very negative logits.
        losses[idx] = -weight * row[label].max(f32::MIN_POSITIVE).ln();

        row[label] -= 1.;
        row.mapv_inplace(|v| v * weight / n_valid as f32);
    }

    CrossEntropy {
        losses,
        valid,
        grad,
    }
}
