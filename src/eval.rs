use std::fmt;

use anyhow::Result;
use ndarray::ArrayView1;

use crate::collate::Batch;
use crate::collective::Collective;
use crate::model::{argmax_rows, Forward, Losses};
use crate::synonyms::SynonymRecall;
use crate::util::IGNORE_INDEX;

const CANDIDATE_COLUMN: usize = 0;
const FINE_EMOTION_COLUMN: usize = 2;
const SENTIMENT_COLUMN: usize = 3;

/// Accumulates the predictions and metric statistics of one replica.
#[derive(Clone, Debug, Default)]
pub struct Evaluation {
    n_examples: usize,
    loss_sum: f32,
    n_sentiments: usize,
    sentiments_correct: usize,
    n_fine_emotions: usize,
    fine_emotions_correct: usize,
    n_ranked: usize,
    reciprocal_rank_sum: f32,
    has_candidates: bool,

    /// Instance tag and predicted sentiment.
    predictions: Vec<(String, usize)>,
}

impl Evaluation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the results of a batch.
    pub fn update(&mut self, batch: &Batch, forward: &Forward, losses: &Losses) {
        let logits = &forward.logits;

        self.n_examples += batch.len();
        self.loss_sum += losses.per_example().sum();

        let sentiments = argmax_rows(logits.sentiment.view());
        let (n, correct) = accuracy(&sentiments, &batch.target_column(SENTIMENT_COLUMN));
        self.n_sentiments += n;
        self.sentiments_correct += correct;

        let fine_emotions = argmax_rows(logits.fine_emotion.view());
        let (n, correct) = accuracy(&fine_emotions, &batch.target_column(FINE_EMOTION_COLUMN));
        self.n_fine_emotions += n;
        self.fine_emotions_correct += correct;

        if let Some(candidates) = &logits.candidates {
            self.has_candidates = true;
            for (row, &gold) in candidates
                .outer_iter()
                .zip(&batch.target_column(CANDIDATE_COLUMN))
            {
                if gold == IGNORE_INDEX {
                    continue;
                }
                self.n_ranked += 1;
                self.reciprocal_rank_sum += 1. / rank(row, gold as usize) as f32;
            }
        }

        self.predictions
            .extend(batch.qids.iter().cloned().zip(sentiments));
    }

    /// Predicted sentiments, in the order of the batches.
    pub fn predictions(&self) -> &[(String, usize)] {
        &self.predictions
    }

    /// Metrics of this replica.
    pub fn metrics(&self) -> Metrics {
        Metrics::from_stats(&self.stats(), self.has_candidates)
    }

    /// Metrics over the replicas of a group.
    pub fn gather_metrics(&self, collective: &dyn Collective) -> Result<Metrics> {
        let mut stats = self.stats();
        collective.all_reduce_sum(&mut stats)?;
        Ok(Metrics::from_stats(&stats, self.has_candidates))
    }

    fn stats(&self) -> Vec<f32> {
        vec![
            self.n_examples as f32,
            self.loss_sum,
            self.n_sentiments as f32,
            self.sentiments_correct as f32,
            self.n_fine_emotions as f32,
            self.fine_emotions_correct as f32,
            self.n_ranked as f32,
            self.reciprocal_rank_sum,
        ]
    }
}

/// Number of labelled examples and the number of correct predictions.
fn accuracy(predictions: &[usize], gold: &[i64]) -> (usize, usize) {
    predictions
        .iter()
        .zip(gold)
        .filter(|(_, &gold)| gold != IGNORE_INDEX)
        .fold((0, 0), |(n, correct), (&prediction, &gold)| {
            (n + 1, correct + (prediction as i64 == gold) as usize)
        })
}

/// 1-based rank of `gold` among the scores, ties rank in favour of gold.
fn rank(scores: ArrayView1<f32>, gold: usize) -> usize {
    let gold_score = scores[gold];
    1 + scores.iter().filter(|&&score| score > gold_score).count()
}

fn ratio(numerator: f32, denominator: f32) -> f32 {
    if denominator > 0. {
        numerator / denominator
    } else {
        0.
    }
}

/// Evaluation metrics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Metrics {
    pub n_examples: usize,

    /// Mean summed loss per example.
    pub loss: f32,

    /// Sentiment accuracy.
    pub acc: f32,

    pub fine_emotion_acc: f32,

    /// Mean reciprocal rank of the gold idiom among the candidates.
    pub mrr: Option<f32>,

    /// Synonym recall of the idiom embeddings, only computed by the root
    /// on the validation split.
    pub synonym_recall: Option<SynonymRecall>,
}

impl Metrics {
    fn from_stats(stats: &[f32], has_candidates: bool) -> Self {
        Metrics {
            n_examples: stats[0] as usize,
            loss: ratio(stats[1], stats[0]),
            acc: ratio(stats[3], stats[2]),
            fine_emotion_acc: ratio(stats[5], stats[4]),
            mrr: if has_candidates {
                Some(ratio(stats[7], stats[6]))
            } else {
                None
            },
            synonym_recall: None,
        }
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "loss: {:.4}, acc: {:.4}, fine acc: {:.4}",
            self.loss, self.acc, self.fine_emotion_acc
        )?;
        if let Some(mrr) = self.mrr {
            write!(f, ", mrr: {:.4}", mrr)?;
        }
        if let Some(recall) = self.synonym_recall {
            write!(f, ", {}", recall)?;
        }
        write!(f, " ({} examples)", self.n_examples)
    }
}
