use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;

use crate::collate::Batch;
use crate::util::seeded_rng;
use crate::vec_simd::scaled_add;

/// RNG stream of encoder initialisation.
const ENCODER_STREAM: u64 = 0xE4C0_DE00;

/// Contextual token encoder.
///
/// Encoders are frozen, so only the forward pass is needed.
pub trait Encoder: Send + Sync {
    fn hidden_size(&self) -> usize;

    /// Encode `[batch, seq_len]` token ids into `[batch, seq_len, hidden]`
    /// hidden states.
    fn encode(
        &self,
        input_ids: ArrayView2<u32>,
        token_type_ids: ArrayView2<u32>,
        attention_mask: ArrayView2<u32>,
    ) -> Array3<f32>;
}

/// Encode every channel of a batch.
pub fn encode_channels(encoder: &dyn Encoder, batch: &Batch) -> Vec<Array3<f32>> {
    (0..batch.n_channels())
        .map(|channel| {
            encoder.encode(
                batch.input_ids.index_axis(Axis(0), channel),
                batch.token_type_ids.index_axis(Axis(0), channel),
                batch.attention_mask.index_axis(Axis(0), channel),
            )
        })
        .collect()
}

/// Embedding lookup encoder.
///
/// The hidden state of a token is the sum of its embedding, its token
/// type embedding and the mean embedding of the attended tokens of the
/// sequence. Tables are drawn from a seeded RNG, so that encoders with
/// the same seed are identical on every replica.
pub struct LookupEncoder {
    embeddings: Array2<f32>,
    type_embeddings: Array2<f32>,
}

impl LookupEncoder {
    pub fn new(vocab_size: usize, hidden_size: usize, seed: u64) -> Self {
        assert!(vocab_size > 0, "Encoder vocabulary is empty");
        assert!(hidden_size > 0, "Hidden size must be positive");
        let mut rng = seeded_rng(seed, ENCODER_STREAM);
        let dist = Normal::new(0f32, 1. / (hidden_size as f32).sqrt())
            .expect("Standard deviation must be finite");
        LookupEncoder {
            embeddings: Array2::random_using((vocab_size, hidden_size), dist, &mut rng),
            type_embeddings: Array2::random_using((2, hidden_size), dist, &mut rng),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.embeddings.nrows()
    }

    fn lookup(&self, id: u32) -> ArrayView1<f32> {
        let id = id as usize;
        assert!(
            id < self.vocab_size(),
            "Token id {} outside of encoder vocabulary of size {}",
            id,
            self.vocab_size()
        );
        self.embeddings.row(id)
    }
}

impl Encoder for LookupEncoder {
    fn hidden_size(&self) -> usize {
        self.embeddings.ncols()
    }

    fn encode(
        &self,
        input_ids: ArrayView2<u32>,
        token_type_ids: ArrayView2<u32>,
        attention_mask: ArrayView2<u32>,
    ) -> Array3<f32> {
        assert_eq!(input_ids.dim(), token_type_ids.dim());
        assert_eq!(input_ids.dim(), attention_mask.dim());

        let (batch_size, seq_len) = input_ids.dim();
        let mut hidden = Array3::zeros((batch_size, seq_len, self.hidden_size()));
        for (idx, mut states) in hidden.outer_iter_mut().enumerate() {
            let ids = input_ids.row(idx);
            let mask = attention_mask.row(idx);

            let mut context = Array1::zeros(self.hidden_size());
            let n_attended = mask.iter().filter(|&&m| m != 0).count();
            for (&id, &m) in ids.iter().zip(mask) {
                if m != 0 {
                    scaled_add(context.view_mut(), self.lookup(id), 1. / n_attended as f32);
                }
            }

            for (pos, mut state) in states.outer_iter_mut().enumerate() {
                let token_type = token_type_ids[(idx, pos)] as usize;
                assert!(token_type < 2, "Unknown token type {}", token_type);
                state.assign(&context);
                scaled_add(state.view_mut(), self.lookup(ids[pos]), 1.);
                scaled_add(
                    state.view_mut(),
                    self.type_embeddings.row(token_type),
                    1.,
                );
            }
        }

        hidden
    }
}
