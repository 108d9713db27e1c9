use std::error::Error;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use anyhow::{anyhow, ensure, Result};

/// Synchronous collective operations between data-parallel replicas.
///
/// Every replica of a group must call the same operations in the same
/// order, each call blocks until all replicas took part. Once a replica
/// aborts the group, pending and later operations of its peers fail with
/// [`Aborted`].
pub trait Collective: Send {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Overwrite `values` on every replica with the values of `root`.
    fn broadcast(&self, values: &mut [f32], root: usize) -> Result<()>;

    /// Replace `values` by the elementwise sum over all replicas.
    fn all_reduce_sum(&self, values: &mut [f32]) -> Result<()>;

    /// Collect the values of all replicas, ordered by rank.
    fn all_gather(&self, values: &[f32]) -> Result<Vec<Vec<f32>>>;

    /// Wait until all replicas reach this point.
    fn barrier(&self) -> Result<()> {
        self.all_gather(&[]).map(|_| ())
    }

    /// Release the peers of a replica that cannot continue.
    fn abort(&self) {}

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// Error of operations on a group that was aborted by one of its replicas.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Aborted;

impl fmt::Display for Aborted {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Replica group was aborted by another replica")
    }
}

impl Error for Aborted {}

/// Collective of a single replica, every operation is a no-op.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn broadcast(&self, _values: &mut [f32], root: usize) -> Result<()> {
        ensure!(root == 0, "Root {} outside of a single process group", root);
        Ok(())
    }

    fn all_reduce_sum(&self, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn all_gather(&self, values: &[f32]) -> Result<Vec<Vec<f32>>> {
        Ok(vec![values.to_owned()])
    }
}

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    generation: usize,
    aborted: bool,
}

struct Shared {
    world_size: usize,
    slots: Mutex<Vec<Option<Vec<f32>>>>,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl Shared {
    fn slots(&self) -> MutexGuard<Vec<Option<Vec<f32>>>> {
        // A replica that panicked while holding the lock leaves the slots
        // intact, the other replicas may still read them.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until all replicas arrived or the group is aborted.
    fn wait(&self) -> Result<()> {
        let mut state = self.state();
        if state.aborted {
            return Err(Aborted.into());
        }

        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.world_size {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(());
        }

        while state.generation == generation && !state.aborted {
            state = self
                .released
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        // Released before the abort, the failure shows up at the next wait.
        if state.generation != generation {
            Ok(())
        } else {
            Err(Aborted.into())
        }
    }

    fn abort(&self) {
        self.state().aborted = true;
        self.released.notify_all();
    }
}

/// Replicas that run as threads of one process.
pub struct LocalGroup;

impl LocalGroup {
    /// Create the collectives of a group of `world_size` replicas, one
    /// per thread.
    pub fn new(world_size: usize) -> Vec<LocalCollective> {
        assert!(world_size > 0, "A group needs at least one replica");
        let shared = Arc::new(Shared {
            world_size,
            slots: Mutex::new(vec![None; world_size]),
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
        });

        (0..world_size)
            .map(|rank| LocalCollective {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }
}

/// Collective of one thread-based replica.
///
/// A replica that panics aborts its group when the collective is dropped
/// during unwinding.
pub struct LocalCollective {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl LocalCollective {
    /// Deposit `values` (if any), wait for the other replicas, read the
    /// slots with `read` and wait until every replica has read.
    fn exchange<F, T>(&self, values: Option<&[f32]>, read: F) -> Result<T>
    where
        F: FnOnce(&[Option<Vec<f32>>]) -> Result<T>,
    {
        if let Some(values) = values {
            self.shared.slots()[self.rank] = Some(values.to_owned());
        }
        self.shared.wait()?;

        let result = read(&self.shared.slots());
        self.shared.wait()?;

        // Rank 0 clears the slots for the next operation, nobody reads
        // them before the next deposit barrier.
        if self.rank == 0 {
            self.shared.slots().iter_mut().for_each(|slot| *slot = None);
        }
        self.shared.wait()?;

        result
    }
}

fn deposited(slot: &Option<Vec<f32>>, rank: usize) -> Result<&[f32]> {
    slot.as_deref()
        .ok_or_else(|| anyhow!("Replica {} did not deposit values", rank))
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn broadcast(&self, values: &mut [f32], root: usize) -> Result<()> {
        ensure!(root < self.world_size, "Root {} outside of the group", root);
        let deposit = if self.rank == root {
            Some(&*values)
        } else {
            None
        };
        let root_values =
            self.exchange(deposit, |slots| Ok(deposited(&slots[root], root)?.to_owned()))?;
        ensure!(
            root_values.len() == values.len(),
            "Root broadcasts {} values, replica {} expects {}",
            root_values.len(),
            self.rank,
            values.len()
        );
        values.copy_from_slice(&root_values);
        Ok(())
    }

    fn all_reduce_sum(&self, values: &mut [f32]) -> Result<()> {
        let sum = self.exchange(Some(&*values), |slots| {
            let mut sum = vec![0f32; values.len()];
            for (rank, slot) in slots.iter().enumerate() {
                let slot = deposited(slot, rank)?;
                ensure!(slot.len() == sum.len(), "Replicas reduce different lengths");
                for (acc, &v) in sum.iter_mut().zip(slot) {
                    *acc += v;
                }
            }
            Ok(sum)
        })?;
        values.copy_from_slice(&sum);
        Ok(())
    }

    fn all_gather(&self, values: &[f32]) -> Result<Vec<Vec<f32>>> {
        self.exchange(Some(values), |slots| {
            slots
                .iter()
                .enumerate()
                .map(|(rank, slot)| deposited(slot, rank).map(ToOwned::to_owned))
                .collect()
        })
    }

    fn abort(&self) {
        self.shared.abort();
    }
}

impl Drop for LocalCollective {
    fn drop(&mut self) {
        if thread::panicking() {
            self.shared.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::{Aborted, Collective, LocalGroup, SingleProcess};

    fn run_group<F, T>(world_size: usize, f: F) -> Vec<T>
    where
        F: Fn(&dyn Collective) -> T + Send + Sync + Copy + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = LocalGroup::new(world_size)
            .into_iter()
            .map(|collective| thread::spawn(move || f(&collective)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn all_reduce_sums_in_rank_order() {
        let results = run_group(3, |c| {
            let mut values = vec![c.rank() as f32, 1.];
            c.all_reduce_sum(&mut values).unwrap();
            // Repeated operations reuse the slots.
            let mut again = vec![1.];
            c.all_reduce_sum(&mut again).unwrap();
            (values, again)
        });
        for (values, again) in results {
            assert_eq!(values, vec![3., 3.]);
            assert_eq!(again, vec![3.]);
        }
    }

    #[test]
    fn broadcast_from_root() {
        let results = run_group(4, |c| {
            let mut values = vec![c.rank() as f32; 3];
            c.broadcast(&mut values, 2).unwrap();
            values
        });
        assert!(results.iter().all(|values| values == &vec![2.; 3]));
    }

    #[test]
    fn all_gather_by_rank() {
        let results = run_group(3, |c| {
            c.barrier().unwrap();
            c.all_gather(&vec![c.rank() as f32; c.rank() + 1]).unwrap()
        });
        for gathered in results {
            assert_eq!(gathered, vec![vec![0.], vec![1., 1.], vec![2., 2., 2.]]);
        }
    }

    #[test]
    fn single_process_is_identity() {
        let c = SingleProcess;
        let mut values = vec![1., 2.];
        c.broadcast(&mut values, 0).unwrap();
        c.all_reduce_sum(&mut values).unwrap();
        assert_eq!(values, vec![1., 2.]);
        assert_eq!(c.all_gather(&values).unwrap(), vec![vec![1., 2.]]);
        assert!(c.is_root());
    }

    #[test]
    fn abort_releases_waiting_replicas() {
        let results = run_group(3, |c| {
            if c.rank() == 1 {
                c.abort();
                return Err(Aborted);
            }
            let mut values = vec![1.];
            let reduced = c.all_reduce_sum(&mut values);
            // Later operations fail without blocking as well.
            let gathered = c.barrier();
            assert!(gathered.is_err());
            reduced.map_err(|err| *err.downcast_ref::<Aborted>().unwrap())
        });
        assert!(results.iter().all(|result| result == &Err(Aborted)));
    }

    #[test]
    fn panicking_replica_aborts_group() {
        let mut group = LocalGroup::new(2).into_iter();
        let waiting = group.next().unwrap();
        let panicking = group.next().unwrap();

        let waiter = thread::spawn(move || waiting.barrier());
        let panicked = thread::spawn(move || {
            let _collective = panicking;
            panic!("replica failed");
        })
        .join();

        assert!(panicked.is_err());
        let err = waiter.join().unwrap().unwrap_err();
        assert!(err.is::<Aborted>());
    }

    #[test]
    fn single_process_rejects_foreign_root() {
        assert!(SingleProcess.broadcast(&mut [1.], 1).is_err());
    }
}
