use ndarray::{Array1, Array2, ArrayView2, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;

/// Affine layer *y = xWᵀ + b*.
#[derive(Clone, Debug, PartialEq)]
pub struct Linear {
    /// `[out, in]`
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    /// Layer with weights and biases drawn from *U(-1/√in, 1/√in)*.
    pub fn new<R>(in_size: usize, out_size: usize, rng: &mut R) -> Self
    where
        R: Rng,
    {
        let bound = 1. / (in_size as f32).sqrt();
        let dist = Uniform::new(-bound, bound);
        Linear {
            weight: Array2::random_using((out_size, in_size), dist, rng),
            bias: Array1::random_using(out_size, dist, rng),
        }
    }

    pub fn zeros(in_size: usize, out_size: usize) -> Self {
        Linear {
            weight: Array2::zeros((out_size, in_size)),
            bias: Array1::zeros(out_size),
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.in_size(), self.out_size())
    }

    pub fn in_size(&self) -> usize {
        self.weight.ncols()
    }

    pub fn out_size(&self) -> usize {
        self.weight.nrows()
    }

    pub fn forward(&self, input: ArrayView2<f32>) -> Array2<f32> {
        input.dot(&self.weight.t()) + &self.bias
    }

    /// Accumulate the parameter gradients in `grad` and return the
    /// gradient of the input.
    pub fn backward(
        &self,
        input: ArrayView2<f32>,
        grad_output: ArrayView2<f32>,
        grad: &mut Linear,
    ) -> Array2<f32> {
        grad.weight += &grad_output.t().dot(&input);
        grad.bias += &grad_output.sum_axis(Axis(0));
        grad_output.dot(&self.weight)
    }
}

/// Two-layer classifier: `Linear(H, H) → ReLU → Linear(H, classes)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Classifier {
    pub hidden: Linear,
    pub output: Linear,
}

impl Classifier {
    pub fn new<R>(hidden_size: usize, n_classes: usize, rng: &mut R) -> Self
    where
        R: Rng,
    {
        Classifier {
            hidden: Linear::new(hidden_size, hidden_size, rng),
            output: Linear::new(hidden_size, n_classes, rng),
        }
    }

    pub fn zeros_like(&self) -> Self {
        Classifier {
            hidden: self.hidden.zeros_like(),
            output: self.output.zeros_like(),
        }
    }

    pub fn n_classes(&self) -> usize {
        self.output.out_size()
    }

    /// Returns the logits and the hidden activations.
    pub fn forward(&self, input: ArrayView2<f32>) -> (Array2<f32>, Array2<f32>) {
        let activation = relu(self.hidden.forward(input));
        let logits = self.output.forward(activation.view());
        (logits, activation)
    }

    pub fn backward(
        &self,
        input: ArrayView2<f32>,
        activation: ArrayView2<f32>,
        grad_logits: ArrayView2<f32>,
        grad: &mut Classifier,
    ) -> Array2<f32> {
        let mut grad_activation = self
            .output
            .backward(activation, grad_logits, &mut grad.output);
        grad_activation.zip_mut_with(&activation, |g, &a| {
            if a <= 0. {
                *g = 0.
            }
        });
        self.hidden
            .backward(input, grad_activation.view(), &mut grad.hidden)
    }
}

pub fn relu(mut x: Array2<f32>) -> Array2<f32> {
    x.mapv_inplace(|v| v.max(0.));
    x
}

pub fn tanh(mut x: Array2<f32>) -> Array2<f32> {
    x.mapv_inplace(f32::tanh);
    x
}

/// Gradient through *y = tanh(x)*, given *y*.
pub fn tanh_backward(output: ArrayView2<f32>, grad_output: ArrayView2<f32>) -> Array2<f32> {
    let mut grad = grad_output.to_owned();
    grad.zip_mut_with(&output, |g, &y| *g *= 1. - y * y);
    grad
}

pub fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}
