use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use rand::seq::SliceRandom;

use crate::collate::{collate, Batch};
use crate::dataset::AffectionDataset;
use crate::util::seeded_rng;

type WorkerResult = Result<(usize, Batch), Box<dyn Any + Send>>;

/// Loads collated batches of one replica.
///
/// Instance indices are shuffled per epoch with a seed that is shared
/// between replicas and then sharded by rank, so that the replicas of a
/// group see disjoint instances.
#[derive(Clone)]
pub struct DataLoader {
    dataset: Arc<AffectionDataset>,
    batch_size: usize,
    rank: usize,
    world_size: usize,
    n_workers: usize,
    seed: u64,
    shuffle: bool,
    even_shards: bool,
}

impl DataLoader {
    /// Loader for training: shuffled, every replica gets the same number
    /// of instances.
    pub fn train(
        dataset: Arc<AffectionDataset>,
        batch_size: usize,
        rank: usize,
        world_size: usize,
        n_workers: usize,
        seed: u64,
    ) -> Self {
        Self::new(dataset, batch_size, rank, world_size, n_workers, seed, true, true)
    }

    /// Loader for evaluation: dataset order, every instance is seen once.
    pub fn eval(
        dataset: Arc<AffectionDataset>,
        batch_size: usize,
        rank: usize,
        world_size: usize,
        n_workers: usize,
        seed: u64,
    ) -> Self {
        Self::new(dataset, batch_size, rank, world_size, n_workers, seed, false, false)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        dataset: Arc<AffectionDataset>,
        batch_size: usize,
        rank: usize,
        world_size: usize,
        n_workers: usize,
        seed: u64,
        shuffle: bool,
        even_shards: bool,
    ) -> Self {
        assert!(batch_size > 0, "Batch size must be positive");
        assert!(n_workers > 0, "At least one worker is required");
        assert!(
            rank < world_size,
            "Rank {} outside of world of size {}",
            rank,
            world_size
        );

        DataLoader {
            dataset,
            batch_size,
            rank,
            world_size,
            n_workers,
            seed,
            shuffle,
            even_shards,
        }
    }

    pub fn dataset(&self) -> &AffectionDataset {
        &self.dataset
    }

    /// Instance indices of this replica in the given epoch.
    pub fn shard(&self, epoch: u64) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            order.shuffle(&mut seeded_rng(self.seed, epoch));
        }

        if self.even_shards && !order.is_empty() {
            let mut idx = 0;
            while order.len() % self.world_size != 0 {
                order.push(order[idx]);
                idx += 1;
            }
        }

        order
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }

    pub fn n_batches(&self, epoch: u64) -> usize {
        let n = self.shard(epoch).len();
        (n + self.batch_size - 1) / self.batch_size
    }

    /// Iterate over the batches of an epoch.
    pub fn epoch(&self, epoch: u64) -> EpochBatches {
        let batches: Arc<Vec<Vec<usize>>> = Arc::new(
            self.shard(epoch)
                .chunks(self.batch_size)
                .map(ToOwned::to_owned)
                .collect(),
        );
        let n_batches = batches.len();

        let (tx, rx) = sync_channel(2 * self.n_workers);
        let n_workers = self.n_workers.min(n_batches.max(1));
        let mut workers = Vec::with_capacity(n_workers);
        for worker in 0..n_workers {
            let tx = tx.clone();
            let batches = batches.clone();
            let dataset = self.dataset.clone();
            let stream_base = (epoch * self.world_size as u64 + self.rank as u64) << 32;
            let seed = self.seed;

            workers.push(thread::spawn(move || {
                for batch_idx in (worker..batches.len()).step_by(n_workers) {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| {
                        let mut rng = seeded_rng(seed, stream_base + batch_idx as u64);
                        let examples = batches[batch_idx]
                            .iter()
                            .map(|&i| dataset.get(i, &mut rng))
                            .collect();
                        collate(examples)
                    }));

                    let failed = result.is_err();
                    if tx.send(result.map(|batch| (batch_idx, batch))).is_err() || failed {
                        break;
                    }
                }
            }));
        }

        EpochBatches {
            rx: Some(rx),
            workers,
            pending: BTreeMap::new(),
            next: 0,
            n_batches,
        }
    }
}

/// Batches of one epoch, in order.
///
/// A panic while constructing a batch is resumed on the consuming thread.
pub struct EpochBatches {
    rx: Option<Receiver<WorkerResult>>,
    workers: Vec<JoinHandle<()>>,
    pending: BTreeMap<usize, Batch>,
    next: usize,
    n_batches: usize,
}

impl EpochBatches {
    pub fn n_batches(&self) -> usize {
        self.n_batches
    }
}

impl Iterator for EpochBatches {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.next == self.n_batches {
            return None;
        }

        while !self.pending.contains_key(&self.next) {
            let rx = self.rx.as_ref()?;
            match rx.recv() {
                Ok(Ok((idx, batch))) => {
                    self.pending.insert(idx, batch);
                }
                Ok(Err(payload)) => {
                    self.rx = None;
                    panic::resume_unwind(payload);
                }
                Err(_) => return None,
            }
        }

        self.next += 1;
        self.pending.remove(&(self.next - 1))
    }
}

impl Drop for EpochBatches {
    fn drop(&mut self) {
        // Workers stop when their send fails.
        self.rx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
