//! Span composition heads over a frozen encoder.

mod encoder;
pub use self::encoder::{encode_channels, Encoder, LookupEncoder};

mod layers;
pub use self::layers::{Classifier, Linear};

mod latent;
pub use self::latent::SoftLookup;

mod span;
pub(crate) use self::span::argmax_rows;
pub use self::span::{pool_channels, span_max_pool};

use std::sync::Arc;

use ndarray::{s, Array1, Array2, Array3, ArrayView2, ArrayViewD, ArrayViewMutD, Axis};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::Rng;

use self::layers::{sigmoid, tanh, tanh_backward};
use crate::collate::Batch;
use crate::config::HeadType;
use crate::loss::{cross_entropy, CrossEntropy};
use crate::util::{N_FINE_EMOTIONS, N_SENTIMENTS};
use crate::vocab::EnlargedCandidates;

/// Target columns of a batch.
const CANDIDATE_COLUMN: usize = 0;
const FINE_EMOTION_COLUMN: usize = 2;
const SENTIMENT_COLUMN: usize = 3;

/// Trainable parameters of a head.
///
/// Which of the optional parameters are present depends on the head
/// type, see `Parameters::new`.
#[derive(Clone, Debug, PartialEq)]
pub struct Parameters {
    pub channel1: Linear,
    pub channel2: Option<Linear>,
    pub compose: Option<Linear>,
    pub gate: Option<Array1<f32>>,

    /// `[len_idiom_vocab, hidden]`
    pub idiom_embedding: Option<Array2<f32>>,
    pub fine_emotion: Classifier,
    pub sentiment: Classifier,
}

impl Parameters {
    /// Randomly initialised parameters of a head.
    pub fn new<R>(head: HeadType, hidden_size: usize, len_idiom_vocab: usize, rng: &mut R) -> Self
    where
        R: Rng,
    {
        let h = hidden_size;
        let channel1 = Linear::new(h, h, rng);
        let (channel2, compose) = match head {
            HeadType::MaxPooling => (None, None),
            HeadType::MaxPoolingMasked => (
                Some(Linear::new(h, h, rng)),
                Some(Linear::new(2 * h, h, rng)),
            ),
            HeadType::LatentIdiom => (
                Some(Linear::new(2 * h, h, rng)),
                Some(Linear::new(2 * h, h, rng)),
            ),
            HeadType::LatentIdiomGate => (
                Some(Linear::new(2 * h, h, rng)),
                Some(Linear::new(h, h, rng)),
            ),
        };

        let gate = if head.has_gate() {
            Some(Array1::from_elem(h, 1. / h as f32))
        } else {
            None
        };

        let idiom_embedding = if head.has_latent_vocab() {
            let dist = Normal::new(0f32, 0.02).expect("Standard deviation must be finite");
            Some(Array2::random_using((len_idiom_vocab, h), dist, rng))
        } else {
            None
        };

        Parameters {
            channel1,
            channel2,
            compose,
            gate,
            idiom_embedding,
            fine_emotion: Classifier::new(h, N_FINE_EMOTIONS, rng),
            sentiment: Classifier::new(h, N_SENTIMENTS, rng),
        }
    }

    pub fn zeros_like(&self) -> Self {
        Parameters {
            channel1: self.channel1.zeros_like(),
            channel2: self.channel2.as_ref().map(Linear::zeros_like),
            compose: self.compose.as_ref().map(Linear::zeros_like),
            gate: self.gate.as_ref().map(|g| Array1::zeros(g.len())),
            idiom_embedding: self.idiom_embedding.as_ref().map(|e| Array2::zeros(e.dim())),
            fine_emotion: self.fine_emotion.zeros_like(),
            sentiment: self.sentiment.zeros_like(),
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.channel1.out_size()
    }

    /// Named views of all tensors, in a fixed order.
    pub fn tensors(&self) -> Vec<(String, ArrayViewD<f32>)> {
        let mut tensors = Vec::new();
        push_linear(&mut tensors, "channel1", &self.channel1);
        if let Some(channel2) = &self.channel2 {
            push_linear(&mut tensors, "channel2", channel2);
        }
        if let Some(compose) = &self.compose {
            push_linear(&mut tensors, "compose", compose);
        }
        if let Some(gate) = &self.gate {
            tensors.push(("gate".to_string(), gate.view().into_dyn()));
        }
        if let Some(embedding) = &self.idiom_embedding {
            tensors.push(("idiom_embedding".to_string(), embedding.view().into_dyn()));
        }
        push_linear(&mut tensors, "fine_emotion.hidden", &self.fine_emotion.hidden);
        push_linear(&mut tensors, "fine_emotion.output", &self.fine_emotion.output);
        push_linear(&mut tensors, "sentiment.hidden", &self.sentiment.hidden);
        push_linear(&mut tensors, "sentiment.output", &self.sentiment.output);

        tensors
    }

    /// Named mutable views of all tensors, in the order of `tensors`.
    pub fn tensors_mut(&mut self) -> Vec<(String, ArrayViewMutD<f32>)> {
        let Parameters {
            channel1,
            channel2,
            compose,
            gate,
            idiom_embedding,
            fine_emotion,
            sentiment,
        } = self;

        let mut tensors = Vec::new();
        push_linear_mut(&mut tensors, "channel1", channel1);
        if let Some(channel2) = channel2 {
            push_linear_mut(&mut tensors, "channel2", channel2);
        }
        if let Some(compose) = compose {
            push_linear_mut(&mut tensors, "compose", compose);
        }
        if let Some(gate) = gate {
            tensors.push(("gate".to_string(), gate.view_mut().into_dyn()));
        }
        if let Some(embedding) = idiom_embedding {
            tensors.push(("idiom_embedding".to_string(), embedding.view_mut().into_dyn()));
        }
        push_linear_mut(&mut tensors, "fine_emotion.hidden", &mut fine_emotion.hidden);
        push_linear_mut(&mut tensors, "fine_emotion.output", &mut fine_emotion.output);
        push_linear_mut(&mut tensors, "sentiment.hidden", &mut sentiment.hidden);
        push_linear_mut(&mut tensors, "sentiment.output", &mut sentiment.output);

        tensors
    }

    pub fn n_values(&self) -> usize {
        self.tensors().iter().map(|(_, t)| t.len()).sum()
    }

    /// All values as one vector, for collectives and checkpoints.
    pub fn to_flat(&self) -> Vec<f32> {
        let mut values = Vec::with_capacity(self.n_values());
        for (_, tensor) in self.tensors() {
            values.extend(tensor.iter());
        }
        values
    }

    /// Overwrite all values from a vector created by `to_flat`.
    ///
    /// Panics when the length does not match.
    pub fn assign_flat(&mut self, values: &[f32]) {
        assert_eq!(
            values.len(),
            self.n_values(),
            "Flat parameters have the wrong length"
        );

        let mut offset = 0;
        for (_, mut tensor) in self.tensors_mut() {
            let len = tensor.len();
            for (dst, &src) in tensor.iter_mut().zip(&values[offset..offset + len]) {
                *dst = src;
            }
            offset += len;
        }
    }

    /// Global l2 norm over all tensors.
    pub fn l2_norm(&self) -> f32 {
        self.tensors()
            .iter()
            .flat_map(|(_, t)| t.iter())
            .map(|&v| v * v)
            .sum::<f32>()
            .sqrt()
    }

    pub fn scale(&mut self, factor: f32) {
        for (_, mut tensor) in self.tensors_mut() {
            tensor.mapv_inplace(|v| v * factor);
        }
    }
}

fn push_linear<'a>(tensors: &mut Vec<(String, ArrayViewD<'a, f32>)>, name: &str, linear: &'a Linear) {
    tensors.push((format!("{}.weight", name), linear.weight.view().into_dyn()));
    tensors.push((format!("{}.bias", name), linear.bias.view().into_dyn()));
}

fn push_linear_mut<'a>(
    tensors: &mut Vec<(String, ArrayViewMutD<'a, f32>)>,
    name: &str,
    linear: &'a mut Linear,
) {
    let Linear { weight, bias } = linear;
    tensors.push((format!("{}.weight", name), weight.view_mut().into_dyn()));
    tensors.push((format!("{}.bias", name), bias.view_mut().into_dyn()));
}

/// Logits of a forward pass.
#[derive(Clone, Debug)]
pub struct Logits {
    /// `[batch, 21]`
    pub fine_emotion: Array2<f32>,

    /// `[batch, 4]`
    pub sentiment: Array2<f32>,

    /// `[batch, candidates]`, for heads with a latent idiom vocabulary.
    pub candidates: Option<Array2<f32>>,
}

/// Losses of a forward pass.
#[derive(Clone, Debug)]
pub struct Losses {
    pub fine_emotion: CrossEntropy,
    pub sentiment: CrossEntropy,
    pub candidates: Option<CrossEntropy>,
}

impl Losses {
    fn components(&self) -> impl Iterator<Item = &CrossEntropy> {
        std::iter::once(&self.fine_emotion)
            .chain(std::iter::once(&self.sentiment))
            .chain(self.candidates.iter())
    }

    /// Training objective: sum of the mean losses of the components.
    pub fn objective(&self) -> f32 {
        self.components().map(CrossEntropy::mean).sum()
    }

    /// Sum of the component losses of every example.
    pub fn per_example(&self) -> Array1<f32> {
        let mut losses = self.fine_emotion.losses.clone();
        for component in self.components().skip(1) {
            losses += &component.losses;
        }
        losses
    }
}

struct Cache {
    pooled: Vec<Array2<f32>>,
    lookup: Option<SoftLookup>,

    /// Input of the second channel projection.
    channel2_input: Option<Array2<f32>>,
    channel1: Array2<f32>,
    channel2: Option<Array2<f32>>,
    gate: Option<Array2<f32>>,

    /// Input of the composition.
    fused: Option<Array2<f32>>,
    emotion: Array2<f32>,
    fine_emotion_activation: Array2<f32>,
    sentiment_activation: Array2<f32>,
}

/// Result of a forward pass.
pub struct Forward {
    pub logits: Logits,
    cache: Cache,
}

/// Affection classifier over pooled idiom spans.
///
/// The head type selects how the literal channel and the masked channel
/// are composed into the emotion state that feeds the fine-emotion and
/// sentiment classifiers.
#[derive(Clone, Debug)]
pub struct AffectionModel {
    head: HeadType,
    params: Parameters,
    candidates: Arc<EnlargedCandidates>,
    fine_emotion_weights: Array1<f32>,
    sentiment_weights: Array1<f32>,
}

impl AffectionModel {
    pub fn new(
        head: HeadType,
        params: Parameters,
        candidates: Arc<EnlargedCandidates>,
        fine_emotion_weights: Array1<f32>,
        sentiment_weights: Array1<f32>,
    ) -> Self {
        assert_eq!(params.channel2.is_some(), head.n_channels() == 2);
        assert_eq!(params.gate.is_some(), head.has_gate());
        assert_eq!(params.idiom_embedding.is_some(), head.has_latent_vocab());
        if let Some(embedding) = &params.idiom_embedding {
            assert!(
                candidates.ids().iter().all(|&id| id < embedding.nrows()),
                "Candidate outside of the idiom embedding table"
            );
        }
        assert_eq!(fine_emotion_weights.len(), N_FINE_EMOTIONS);
        assert_eq!(sentiment_weights.len(), N_SENTIMENTS);

        AffectionModel {
            head,
            params,
            candidates,
            fine_emotion_weights,
            sentiment_weights,
        }
    }

    pub fn head(&self) -> HeadType {
        self.head
    }

    pub fn hidden_size(&self) -> usize {
        self.params.hidden_size()
    }

    pub fn candidates(&self) -> &EnlargedCandidates {
        &self.candidates
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    /// Compute the logits from per-channel hidden states
    /// `[batch, seq_len, hidden]`.
    pub fn forward(&self, hidden: &[Array3<f32>], batch: &Batch) -> Forward {
        assert_eq!(
            hidden.len(),
            self.head.n_channels(),
            "Head {} expects {} channels",
            self.head,
            self.head.n_channels()
        );
        for channel in hidden {
            assert_eq!(channel.len_of(Axis(2)), self.hidden_size());
        }

        let params = &self.params;
        let pooled = pool_channels(hidden, &batch.gather_index);
        let channel1 = tanh(params.channel1.forward(pooled[0].view()));

        let mut lookup = None;
        let mut channel2_input = None;
        let mut channel2 = None;
        let mut gate = None;
        let mut fused = None;
        let emotion = match self.head {
            HeadType::MaxPooling => channel1.clone(),
            head => {
                let masked = pooled[1].view();
                let input = if head.has_latent_vocab() {
                    let soft = SoftLookup::forward(
                        masked,
                        self.idiom_embedding().view(),
                        &self.candidates,
                    );
                    let input = concat_columns(masked, soft.state.view());
                    lookup = Some(soft);
                    input
                } else {
                    masked.to_owned()
                };
                let c2 = tanh(self.channel2().forward(input.view()));

                let composed_input = if head.has_gate() {
                    let mut g = &channel1 * self.gate_weights();
                    g.mapv_inplace(sigmoid);
                    let mixed = &g * &channel1 + &g.mapv(|v| 1. - v) * &c2;
                    gate = Some(g);
                    mixed
                } else {
                    concat_columns(channel1.view(), c2.view())
                };
                let emotion = tanh(self.compose().forward(composed_input.view()));

                channel2_input = Some(input);
                channel2 = Some(c2);
                fused = Some(composed_input);
                emotion
            }
        };

        let (fine_emotion, fine_emotion_activation) = params.fine_emotion.forward(emotion.view());
        let (sentiment, sentiment_activation) = params.sentiment.forward(emotion.view());

        Forward {
            logits: Logits {
                fine_emotion,
                sentiment,
                candidates: lookup.as_ref().map(|soft: &SoftLookup| soft.logits.clone()),
            },
            cache: Cache {
                pooled,
                lookup,
                channel2_input,
                channel1,
                channel2,
                gate,
                fused,
                emotion,
                fine_emotion_activation,
                sentiment_activation,
            },
        }
    }

    /// Per-example losses against the batch targets.
    ///
    /// Emotion and sentiment losses are weighted by the class weights,
    /// the candidate loss is unweighted.
    pub fn loss(&self, forward: &Forward, batch: &Batch) -> Losses {
        let logits = &forward.logits;
        Losses {
            fine_emotion: cross_entropy(
                logits.fine_emotion.view(),
                &batch.target_column(FINE_EMOTION_COLUMN),
                Some(self.fine_emotion_weights.view()),
            ),
            sentiment: cross_entropy(
                logits.sentiment.view(),
                &batch.target_column(SENTIMENT_COLUMN),
                Some(self.sentiment_weights.view()),
            ),
            candidates: logits.candidates.as_ref().map(|candidates| {
                cross_entropy(
                    candidates.view(),
                    &batch.target_column(CANDIDATE_COLUMN),
                    None,
                )
            }),
        }
    }

    /// Gradients of the training objective.
    pub fn backward(&self, forward: &Forward, losses: &Losses) -> Parameters {
        let params = &self.params;
        let cache = &forward.cache;
        let mut grads = params.zeros_like();

        let emotion = cache.emotion.view();
        let mut grad_emotion = params.fine_emotion.backward(
            emotion,
            cache.fine_emotion_activation.view(),
            losses.fine_emotion.grad.view(),
            &mut grads.fine_emotion,
        );
        grad_emotion += &params.sentiment.backward(
            emotion,
            cache.sentiment_activation.view(),
            losses.sentiment.grad.view(),
            &mut grads.sentiment,
        );

        let (grad_channel1, grad_channel2) = match self.head {
            HeadType::MaxPooling => (grad_emotion, None),
            head => {
                let grad_composed = tanh_backward(emotion, grad_emotion.view());
                let grad_fused = self.compose().backward(
                    cached(&cache.fused),
                    grad_composed.view(),
                    grads.compose.as_mut().expect("Head without composition"),
                );

                if head.has_gate() {
                    self.gate_backward(cache, grad_fused, &mut grads)
                } else {
                    let h = self.hidden_size();
                    (
                        grad_fused.slice(s![.., ..h]).to_owned(),
                        Some(grad_fused.slice(s![.., h..]).to_owned()),
                    )
                }
            }
        };

        let grad_pre1 = tanh_backward(cache.channel1.view(), grad_channel1.view());
        params
            .channel1
            .backward(cache.pooled[0].view(), grad_pre1.view(), &mut grads.channel1);

        if let Some(grad_channel2) = grad_channel2 {
            let grad_pre2 = tanh_backward(cached(&cache.channel2), grad_channel2.view());
            let grad_input2 = self.channel2().backward(
                cached(&cache.channel2_input),
                grad_pre2.view(),
                grads.channel2.as_mut().expect("Head without second channel"),
            );

            if let Some(lookup) = &cache.lookup {
                let h = self.hidden_size();
                let grad_table = grads
                    .idiom_embedding
                    .as_mut()
                    .expect("Head without idiom embeddings");
                lookup.backward(
                    cache.pooled[1].view(),
                    grad_input2.slice(s![.., h..]),
                    losses.candidates.as_ref().map(|loss| loss.grad.view()),
                    &self.candidates,
                    grad_table.view_mut(),
                );
            }
        }

        grads
    }

    /// Backpropagate through *s = σ(g ⊙ c1) ⊙ c1 + (1 - σ(g ⊙ c1)) ⊙ c2*.
    fn gate_backward(
        &self,
        cache: &Cache,
        grad_fused: Array2<f32>,
        grads: &mut Parameters,
    ) -> (Array2<f32>, Option<Array2<f32>>) {
        let g = self.gate_weights();
        let gate = cached(&cache.gate);
        let channel1 = cache.channel1.view();
        let channel2 = cached(&cache.channel2);

        // ∂s/∂gate = c1 - c2, ∂gate/∂(g ⊙ c1) = gate (1 - gate)
        let grad_pre_gate =
            &grad_fused * &(&channel1 - &channel2) * &gate.mapv(|v| v * (1. - v));

        let grad_channel1 = &grad_fused * &gate + &(&grad_pre_gate * g);
        let grad_channel2 = &grad_fused * &gate.mapv(|v| 1. - v);

        let grad_g = (&grad_pre_gate * &channel1).sum_axis(Axis(0));
        *grads.gate.as_mut().expect("Head without gate") += &grad_g;

        (grad_channel1, Some(grad_channel2))
    }

    fn channel2(&self) -> &Linear {
        self.params
            .channel2
            .as_ref()
            .expect("Head without second channel")
    }

    fn compose(&self) -> &Linear {
        self.params
            .compose
            .as_ref()
            .expect("Head without composition")
    }

    fn gate_weights(&self) -> &Array1<f32> {
        self.params.gate.as_ref().expect("Head without gate")
    }

    fn idiom_embedding(&self) -> &Array2<f32> {
        self.params
            .idiom_embedding
            .as_ref()
            .expect("Head without idiom embeddings")
    }
}

fn cached(array: &Option<Array2<f32>>) -> ArrayView2<f32> {
    array
        .as_ref()
        .expect("Forward pass did not cache the array")
        .view()
}

fn concat_columns(left: ArrayView2<f32>, right: ArrayView2<f32>) -> Array2<f32> {
    assert_eq!(left.nrows(), right.nrows());
    let mut concat = Array2::zeros((left.nrows(), left.ncols() + right.ncols()));
    concat.slice_mut(s![.., ..left.ncols()]).assign(&left);
    concat.slice_mut(s![.., left.ncols()..]).assign(&right);
    concat
}
