//! Static partitioning of time samples across ranks,
//! and the reductions that combine per-rank results.

use std::ops::Range;

use itertools::izip;
use tracing::debug;

use crate::RuntimeContext;

/// Split `0..n` into `workers` contiguous blocks in rank order.
///
/// Block sizes differ by at most one;
/// the first `n % workers` blocks get the extra element.
///
/// # Panics
///
/// If `workers` is zero.
pub fn partition(n: usize, workers: usize) -> Vec<Range<usize>> {
    assert!(workers >= 1, "cannot partition over zero workers");

    let base = n / workers;
    let remainder = n % workers;
    let mut start = 0;
    (0..workers)
        .map(|rank| {
            let len = base + usize::from(rank < remainder);
            let block = start..start + len;
            start += len;
            block
        })
        .collect()
}

/// Compute the partition of `0..n` on the coordinator
/// and hand each rank its own block.
///
/// Every rank blocks until the coordinator has distributed the blocks.
pub fn scatter_partition(ctx: &RuntimeContext, n: usize) -> Range<usize> {
    let blocks = if ctx.is_coordinator() {
        partition(n, ctx.size())
    } else {
        Vec::new()
    };
    let local = ctx
        .comm()
        .scatter_ranges(&blocks, RuntimeContext::COORDINATOR);
    debug!(
        "Rank {}/{} got samples {:?} of {}",
        ctx.rank(),
        ctx.size(),
        local,
        n
    );
    local
}

/// Sum a partial vector over all ranks; every rank gets the result.
///
/// Partial sums are combined in rank order,
/// so the result is identical on every rank,
/// but since each rank sums its own samples first,
/// it can differ in the last bits between different worker counts.
/// Use an [`Aggregator`] where that matters.
pub fn aggregate(ctx: &RuntimeContext, local: &[f64]) -> Vec<f64> {
    // every rank must have its partial ready before anyone accumulates
    ctx.barrier();
    let global = ctx.comm().all_reduce_sum(local);
    // and the result must be everywhere before anyone consumes it
    ctx.barrier();
    global
}

/// Collects per-sample contributions on one rank
/// and sums them over all ranks in global sample order.
///
/// Because the additions happen in the same order
/// no matter how samples were split between ranks,
/// the result is bit-for-bit independent of the worker count.
#[derive(Clone, Debug)]
pub struct Aggregator {
    width: usize,
    contributions: Vec<(usize, Vec<f64>)>,
}

impl Aggregator {
    /// Create an aggregator for contributions of `width` values each.
    pub fn new(width: usize) -> Self {
        Self {
            width,
            contributions: Vec::new(),
        }
    }

    /// Number of values in each contribution.
    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of contributions pushed on this rank.
    #[inline]
    pub fn len(&self) -> usize {
        self.contributions.len()
    }

    /// Check whether this rank has pushed any contributions.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.contributions.is_empty()
    }

    /// Add the contribution of the sample with global index `sample`.
    ///
    /// # Panics
    ///
    /// If the contribution doesn't have `width` values.
    pub fn push(&mut self, sample: usize, values: &[f64]) {
        assert_eq!(
            values.len(),
            self.width,
            "contribution has the wrong number of values"
        );
        self.contributions.push((sample, values.to_vec()));
    }

    /// Sum the contributions of all ranks in ascending sample order.
    /// Every rank gets the same result.
    ///
    /// This is a collective operation.
    pub fn all_reduce(self, ctx: &RuntimeContext) -> Vec<f64> {
        // contributions are packed as [sample, values..] records
        let record_len = self.width + 1;
        let mut packed = Vec::with_capacity(self.contributions.len() * record_len);
        for (sample, values) in &self.contributions {
            packed.push(*sample as f64);
            packed.extend_from_slice(values);
        }

        ctx.barrier();
        let gathered = ctx.comm().all_gather(&packed);

        let mut records: Vec<(usize, &[f64])> = gathered
            .iter()
            .flat_map(|rank_records| rank_records.chunks_exact(record_len))
            .map(|record| (record[0] as usize, &record[1..]))
            .collect();
        records.sort_by_key(|(sample, _)| *sample);

        let mut sum = vec![0.; self.width];
        for (_, values) in records {
            for (acc, value) in izip!(&mut sum, values) {
                *acc += value;
            }
        }
        ctx.barrier();
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LocalCluster;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn partitions_are_complete_and_balanced() {
        for n in 0..40 {
            for workers in 1..10 {
                let blocks = partition(n, workers);
                assert_eq!(blocks.len(), workers);
                itertools::assert_equal(blocks.iter().cloned().flatten(), 0..n);

                let sizes: Vec<usize> = blocks.iter().map(|b| b.len()).collect();
                let max = sizes.iter().max().copied().unwrap_or(0);
                let min = sizes.iter().min().copied().unwrap_or(0);
                assert!(max - min <= 1);
                // the larger blocks come first
                assert!(sizes.windows(2).all(|w| w[0] >= w[1]));
            }
        }

        itertools::assert_equal(partition(10, 4), [0..3, 3..6, 6..8, 8..10]);
        itertools::assert_equal(partition(2, 3), [0..1, 1..2, 2..2]);
    }

    #[test]
    #[should_panic]
    fn zero_workers_is_an_error() {
        partition(5, 0);
    }

    #[test]
    fn every_rank_gets_its_own_block() {
        for size in [1, 3, 4] {
            let blocks = LocalCluster::run(size, |comm| {
                scatter_partition(&RuntimeContext::new(comm), 11)
            });
            assert_eq!(blocks, partition(11, size));
        }
    }

    fn dataset() -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(1234);
        (0..23)
            .map(|_| {
                (0..4)
                    .map(|_| rng.gen_range(-1e3..1e3) * 10f64.powi(rng.gen_range(-8..8)))
                    .collect()
            })
            .collect()
    }

    #[test]
    fn aggregation_is_independent_of_worker_count() {
        let data = dataset();
        let mut sequential = vec![0.; 4];
        for sample in &data {
            for (acc, value) in izip!(&mut sequential, sample) {
                *acc += value;
            }
        }

        for workers in [1, 2, 5, 7] {
            let results = LocalCluster::run(workers, |comm| {
                let ctx = RuntimeContext::new(comm);
                let local = scatter_partition(&ctx, data.len());
                let mut aggregator = Aggregator::new(4);
                for sample in local {
                    aggregator.push(sample, &data[sample]);
                }
                aggregator.all_reduce(&ctx)
            });

            assert_eq!(results.len(), workers);
            for result in results {
                // exact, not approximate
                assert_eq!(result, sequential, "workers: {workers}");
            }
        }
    }

    #[test]
    fn partial_sums_agree_across_ranks() {
        let data = dataset();
        for workers in [1, 2, 5, 7] {
            let results = LocalCluster::run(workers, |comm| {
                let ctx = RuntimeContext::new(comm);
                let mut partial = vec![0.; 4];
                for sample in scatter_partition(&ctx, data.len()) {
                    for (acc, value) in izip!(&mut partial, &data[sample]) {
                        *acc += value;
                    }
                }
                aggregate(&ctx, &partial)
            });

            let first = &results[0];
            assert!(results.iter().all(|r| r == first));
            let expected: f64 = data.iter().map(|s| s[0]).sum();
            approx::assert_relative_eq!(first[0], expected, epsilon = 1e-3, max_relative = 1e-9);
        }
    }
}
