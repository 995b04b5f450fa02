//! The message-passing runtime the surrogate's parallel steps run on.
//!
//! Components never look up their rank from global state;
//! they receive a [`RuntimeContext`] wrapping some [`Communicator`].
//! [`SingleProcess`] is the trivial one-rank runtime
//! and [`LocalCluster`] simulates several ranks with threads,
//! which is what the multi-rank tests run on.
//! With the `mpi` feature, `MpiComm` runs the ranks as MPI processes.

use std::ops::Range;
use std::sync::{Barrier, Mutex, MutexGuard, PoisonError};

use itertools::izip;

#[cfg(feature = "mpi")]
mod mpi_comm;
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;

/// Collective operations over a fixed group of ranks.
///
/// Every collective must be called by all ranks in the same order,
/// otherwise the group deadlocks.
pub trait Communicator {
    /// Index of this rank in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Block until every rank has reached the barrier.
    fn barrier(&self);

    /// Replace `buffer` on every rank with its contents on `root`.
    fn broadcast(&self, buffer: &mut Vec<f64>, root: usize);

    /// Hand out one index range per rank from `root`.
    ///
    /// `blocks` is only read on `root` and must have one entry per rank there.
    fn scatter_ranges(&self, blocks: &[Range<usize>], root: usize) -> Range<usize>;

    /// Collect the local buffer of every rank, in rank order, on every rank.
    fn all_gather(&self, local: &[f64]) -> Vec<Vec<f64>>;

    /// Elementwise sum of the local buffers of every rank,
    /// available on every rank.
    ///
    /// Partial buffers are added in ascending rank order,
    /// so every rank computes a bitwise identical result.
    fn all_reduce_sum(&self, local: &[f64]) -> Vec<f64> {
        let mut sum = vec![0.; local.len()];
        for partial in self.all_gather(local) {
            for (acc, value) in izip!(&mut sum, &partial) {
                *acc += value;
            }
        }
        sum
    }
}

/// The runtime of a single, non-parallel process.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl Communicator for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn barrier(&self) {}

    fn broadcast(&self, _buffer: &mut Vec<f64>, _root: usize) {}

    fn scatter_ranges(&self, blocks: &[Range<usize>], _root: usize) -> Range<usize> {
        blocks.first().cloned().unwrap_or(0..0)
    }

    fn all_gather(&self, local: &[f64]) -> Vec<Vec<f64>> {
        vec![local.to_vec()]
    }
}

/// A group of ranks simulated by threads of the current process.
pub struct LocalCluster;

impl LocalCluster {
    /// Run `f` on `size` ranks, each on its own scoped thread,
    /// and return the results in rank order.
    ///
    /// A panic on any rank is propagated once all threads have finished.
    /// Note that a rank panicking in the middle of a collective
    /// leaves the others waiting on it forever, just like a crashed MPI process.
    pub fn run<T, F>(size: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(&ThreadComm) -> T + Sync,
    {
        assert!(size >= 1, "a cluster needs at least one rank");

        let shared = Shared {
            barrier: Barrier::new(size),
            buffers: Mutex::new(vec![Vec::new(); size]),
            ranges: Mutex::new(Vec::new()),
        };

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..size)
                .map(|rank| {
                    let shared = &shared;
                    let f = &f;
                    scope.spawn(move || f(&ThreadComm { rank, size, shared }))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
                })
                .collect()
        })
    }
}

/// Exchange slots shared by the ranks of a [`LocalCluster`].
struct Shared {
    barrier: Barrier,
    buffers: Mutex<Vec<Vec<f64>>>,
    ranges: Mutex<Vec<Range<usize>>>,
}

/// One rank of a [`LocalCluster`].
///
/// Collectives write to a shared slot, wait for every rank,
/// read, and wait again so that no rank overwrites a slot
/// before the others are done reading it.
pub struct ThreadComm<'a> {
    rank: usize,
    size: usize,
    shared: &'a Shared,
}

impl<'a> ThreadComm<'a> {
    // poisoning only means another rank panicked mid-collective
    fn buffers(&self) -> MutexGuard<'a, Vec<Vec<f64>>> {
        self.shared
            .buffers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn ranges(&self) -> MutexGuard<'a, Vec<Range<usize>>> {
        self.shared
            .ranges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<'a> Communicator for ThreadComm<'a> {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn barrier(&self) {
        self.shared.barrier.wait();
    }

    fn broadcast(&self, buffer: &mut Vec<f64>, root: usize) {
        if self.rank == root {
            self.buffers()[root] = buffer.clone();
        }
        self.barrier();
        if self.rank != root {
            *buffer = self.buffers()[root].clone();
        }
        self.barrier();
    }

    fn scatter_ranges(&self, blocks: &[Range<usize>], root: usize) -> Range<usize> {
        if self.rank == root {
            *self.ranges() = blocks.to_vec();
        }
        self.barrier();
        let local = self.ranges().get(self.rank).cloned().unwrap_or(0..0);
        self.barrier();
        local
    }

    fn all_gather(&self, local: &[f64]) -> Vec<Vec<f64>> {
        self.buffers()[self.rank] = local.to_vec();
        self.barrier();
        let gathered = self.buffers().clone();
        self.barrier();
        gathered
    }
}

/// The runtime a component executes in, passed explicitly to everything
/// that needs to know its rank.
#[derive(Clone, Copy)]
pub struct RuntimeContext<'a> {
    comm: &'a dyn Communicator,
}

impl<'a> RuntimeContext<'a> {
    /// Rank that performs coordinator-only work such as computing partitions.
    pub const COORDINATOR: usize = 0;

    /// Create a context on top of a communicator.
    pub fn new(comm: &'a dyn Communicator) -> Self {
        Self { comm }
    }

    /// Index of this rank.
    #[inline]
    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// Number of ranks.
    #[inline]
    pub fn size(&self) -> usize {
        self.comm.size()
    }

    /// Check whether this rank is the coordinator.
    #[inline]
    pub fn is_coordinator(&self) -> bool {
        self.rank() == Self::COORDINATOR
    }

    /// The underlying communicator.
    #[inline]
    pub fn comm(&self) -> &'a dyn Communicator {
        self.comm
    }

    /// Block until every rank has reached this point.
    #[inline]
    pub fn barrier(&self) {
        self.comm.barrier()
    }
}

impl RuntimeContext<'static> {
    /// A context for a single, non-parallel process.
    pub fn single() -> Self {
        Self {
            comm: &SingleProcess,
        }
    }
}

impl std::fmt::Debug for RuntimeContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("rank", &self.rank())
            .field("size", &self.size())
            .finish()
    }
}
