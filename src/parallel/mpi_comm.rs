//! [`Communicator`] on top of an MPI communicator.
//!
//! MPI must be initialized before an [`MpiComm`] is created
//! and the universe kept alive for as long as it is used:
//!
//! ```ignore
//! let universe = mpi::initialize().ok_or("MPI was already initialized")?;
//! let comm = romcouple::MpiComm::new(universe.world());
//! let ctx = romcouple::RuntimeContext::new(&comm);
//! ```

use std::ops::Range;

use itertools::izip;
use mpi::{datatype::PartitionMut, topology::SimpleCommunicator, traits::*, Count};

use super::Communicator;

/// The ranks of an MPI communicator, usually the world.
pub struct MpiComm {
    world: SimpleCommunicator,
}

impl MpiComm {
    /// Wrap an MPI communicator.
    pub fn new(world: SimpleCommunicator) -> Self {
        Self { world }
    }

    /// The world communicator of an already initialized MPI environment.
    pub fn world() -> Self {
        Self::new(SimpleCommunicator::world())
    }
}

impl Communicator for MpiComm {
    fn rank(&self) -> usize {
        self.world.rank() as usize
    }

    fn size(&self) -> usize {
        self.world.size() as usize
    }

    fn barrier(&self) {
        self.world.barrier();
    }

    fn broadcast(&self, buffer: &mut Vec<f64>, root: usize) {
        let root = self.world.process_at_rank(root as Count);
        // receivers don't know the length in advance
        let mut len = buffer.len() as u64;
        root.broadcast_into(&mut len);
        buffer.resize(len as usize, 0.);
        root.broadcast_into(&mut buffer[..]);
    }

    fn scatter_ranges(&self, blocks: &[Range<usize>], root: usize) -> Range<usize> {
        let size = self.size();
        let root_process = self.world.process_at_rank(root as Count);
        // each range travels as a (start, end) pair
        let mut local = [0u64; 2];
        if self.rank() == root {
            let mut send: Vec<u64> = blocks
                .iter()
                .take(size)
                .flat_map(|r| [r.start as u64, r.end as u64])
                .collect();
            send.resize(2 * size, 0);
            root_process.scatter_into_root(&send[..], &mut local[..]);
        } else {
            root_process.scatter_into(&mut local[..]);
        }
        local[0] as usize..local[1] as usize
    }

    fn all_gather(&self, local: &[f64]) -> Vec<Vec<f64>> {
        let mut lengths = vec![0u64; self.size()];
        self.world.all_gather_into(&(local.len() as u64), &mut lengths[..]);

        let counts: Vec<Count> = lengths.iter().map(|&n| n as Count).collect();
        let displs: Vec<Count> = counts
            .iter()
            .scan(0, |offset, &n| {
                let start = *offset;
                *offset += n;
                Some(start)
            })
            .collect();
        let total: usize = lengths.iter().map(|&n| n as usize).sum();

        let mut flat = vec![0.; total];
        {
            let mut partition = PartitionMut::new(&mut flat[..], &counts[..], &displs[..]);
            self.world.all_gather_varcount_into(local, &mut partition);
        }

        izip!(&displs, &counts)
            .map(|(&start, &n)| flat[start as usize..(start + n) as usize].to_vec())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RuntimeContext;

    // MPI can only be initialized once per process,
    // so every collective is checked in this one test
    #[test]
    fn world_collectives() {
        let universe = mpi::initialize().unwrap();
        let comm = MpiComm::new(universe.world());
        let ctx = RuntimeContext::new(&comm);
        let (rank, size) = (ctx.rank(), ctx.size());
        assert!(rank < size);

        let mut buffer = if ctx.is_coordinator() {
            vec![10., 20.]
        } else {
            Vec::new()
        };
        comm.broadcast(&mut buffer, RuntimeContext::COORDINATOR);
        assert_eq!(buffer, vec![10., 20.]);

        let blocks: Vec<_> = (0..size).map(|r| r * 10..r * 10 + r).collect();
        let local = comm.scatter_ranges(
            if ctx.is_coordinator() { &blocks[..] } else { &[] },
            RuntimeContext::COORDINATOR,
        );
        assert_eq!(local, rank * 10..rank * 10 + rank);

        // uneven lengths per rank
        let gathered = comm.all_gather(&vec![rank as f64; rank + 1]);
        assert_eq!(gathered.len(), size);
        for (r, part) in gathered.iter().enumerate() {
            assert_eq!(part, &vec![r as f64; r + 1]);
        }

        let sum = comm.all_reduce_sum(&[rank as f64, 1.]);
        assert_eq!(sum, vec![(size * (size - 1) / 2) as f64, size as f64]);
        comm.barrier();
    }
}
