//! Randomized multi-threaded workload against the process-wide allocator.
//!
//! Every worker keeps its live blocks in an address-ordered map. Each block is
//! filled with its own byte pattern on allocation and checked before it is
//! released, so a block handed out twice or overwritten by a neighbor shows up
//! as corruption. Overlaps between the blocks of one worker are caught
//! directly from the map.

use std::{
    collections::BTreeMap,
    io,
    ptr::NonNull,
    slice,
    thread,
    time::{Duration, Instant},
};

use extent_alloc::{AllocateError, ExtentAllocator, global};
use log::{debug, trace};
use rand::{Rng as _, SeedableRng as _, rngs::StdRng};
use snafu::{Location, OptionExt as _, ResultExt as _, Snafu, ensure};

/// Alignments the workload picks from.
pub const ALIGNMENTS: [usize; 5] = [8, 16, 32, 64, 4096];

/// Probability of allocating rather than releasing when both are possible.
const ALLOCATE_RATIO: f64 = 0.55;

#[derive(Debug, Snafu)]
pub enum WorkloadError {
    #[snafu(display("failed to spawn worker {worker}"))]
    Spawn {
        worker: usize,
        #[snafu(source)]
        source: io::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("worker {worker} panicked"))]
    WorkerPanicked {
        worker: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("worker {worker}: allocation of {size} bytes aligned to {align} failed"))]
    Allocate {
        worker: usize,
        size: usize,
        align: usize,
        #[snafu(source)]
        source: AllocateError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("worker {worker}: block at {addr:#x} is not aligned to {align}"))]
    Misaligned {
        worker: usize,
        addr: usize,
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "worker {worker}: block at {addr:#x} ({size} bytes) overlaps live block at {other:#x}"
    ))]
    Overlap {
        worker: usize,
        addr: usize,
        size: usize,
        other: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("worker {worker}: block at {addr:#x} corrupted at offset {offset}"))]
    Corrupted {
        worker: usize,
        addr: usize,
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Workload parameters.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub threads: usize,
    pub iterations: usize,
    pub max_size: usize,
    pub seed: u64,
}

/// Counters reported by one worker.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkerStats {
    pub allocations: usize,
    pub releases: usize,
    pub bytes: u64,
    pub peak_live: usize,
}

/// Totals over all workers.
#[derive(Debug, Default, Clone, Copy)]
pub struct Summary {
    pub threads: usize,
    pub allocations: usize,
    pub releases: usize,
    pub bytes: u64,
    pub peak_live: usize,
    pub elapsed: Duration,
}

impl Summary {
    fn add(&mut self, stats: &WorkerStats) {
        self.threads += 1;
        self.allocations += stats.allocations;
        self.releases += stats.releases;
        self.bytes += stats.bytes;
        self.peak_live = self.peak_live.max(stats.peak_live);
    }
}

/// Runs `config.threads` workers to completion and sums their counters.
///
/// Every worker is joined before the first failure is returned.
pub fn run(config: &Config) -> Result<Summary, WorkloadError> {
    let start = Instant::now();
    let results = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(config.threads);
        for worker in 0..config.threads {
            let handle = thread::Builder::new()
                .name(format!("worker-{worker}"))
                .spawn_scoped(scope, move || Worker::new(worker).run(config))
                .context(SpawnSnafu { worker });
            handles.push(handle);
        }
        handles
            .into_iter()
            .enumerate()
            .map(|(worker, handle)| {
                handle?
                    .join()
                    .ok()
                    .context(WorkerPanickedSnafu { worker })?
            })
            .collect::<Vec<_>>()
    });

    let mut summary = Summary::default();
    for stats in results {
        summary.add(&stats?);
    }
    summary.elapsed = start.elapsed();
    Ok(summary)
}

#[derive(Debug)]
struct Block {
    ptr: NonNull<u8>,
    size: usize,
    pattern: u8,
}

impl Block {
    fn addr(&self) -> usize {
        self.ptr.addr().get()
    }

    fn fill(&self) {
        unsafe { self.ptr.write_bytes(self.pattern, self.size) };
    }

    /// Returns the offset of the first byte that lost the pattern.
    fn first_corrupted(&self) -> Option<usize> {
        let bytes = unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) };
        bytes.iter().position(|&byte| byte != self.pattern)
    }
}

struct Worker {
    id: usize,
    heap: &'static ExtentAllocator<std::alloc::System>,
    live: BTreeMap<usize, Block>,
    stats: WorkerStats,
}

impl Worker {
    fn new(id: usize) -> Self {
        Self {
            id,
            heap: global::instance(),
            live: BTreeMap::new(),
            stats: WorkerStats::default(),
        }
    }

    fn run(mut self, config: &Config) -> Result<WorkerStats, WorkloadError> {
        let worker_seed = config
            .seed
            .wrapping_add(u64::try_from(self.id).unwrap_or(u64::MAX));
        let mut rng = StdRng::seed_from_u64(worker_seed);

        for _ in 0..config.iterations {
            if self.live.is_empty() || rng.gen_bool(ALLOCATE_RATIO) {
                let size = rng.gen_range(1..=config.max_size);
                let align = ALIGNMENTS[rng.gen_range(0..ALIGNMENTS.len())];
                let pattern = rng.gen_range(1..=u8::MAX);
                self.allocate(size, align, pattern)?;
            } else {
                let pick = rng.gen_range(0..self.live.len());
                self.release_nth(pick)?;
            }
        }

        while !self.live.is_empty() {
            self.release_nth(0)?;
        }
        debug!(
            "finished: {} allocations, {} bytes, peak {} live blocks",
            self.stats.allocations, self.stats.bytes, self.stats.peak_live
        );
        Ok(self.stats)
    }

    fn allocate(&mut self, size: usize, align: usize, pattern: u8) -> Result<(), WorkloadError> {
        let worker = self.id;
        let ptr = self
            .heap
            .allocate(size, align)
            .context(AllocateSnafu { worker, size, align })?;
        let block = Block { ptr, size, pattern };
        let addr = block.addr();
        trace!("allocate {size} bytes aligned to {align} at {addr:#x}");

        // Tracked before any check so that the block is released on failure.
        let prev = self.live.range(..addr).next_back().map(|(_, b)| (b.addr(), b.size));
        let next = self.live.range(addr..).next().map(|(&other, _)| other);
        self.live.insert(addr, block);
        self.stats.allocations += 1;
        self.stats.bytes += u64::try_from(size).unwrap_or(u64::MAX);
        self.stats.peak_live = self.stats.peak_live.max(self.live.len());

        ensure!(addr.is_multiple_of(align), MisalignedSnafu { worker, addr, align });
        if let Some((other, other_size)) = prev {
            ensure!(
                other + other_size <= addr,
                OverlapSnafu { worker, addr, size, other }
            );
        }
        if let Some(other) = next {
            ensure!(addr + size <= other, OverlapSnafu { worker, addr, size, other });
        }

        self.live[&addr].fill();
        Ok(())
    }

    fn release_nth(&mut self, n: usize) -> Result<(), WorkloadError> {
        let Some((&addr, _)) = self.live.iter().nth(n) else {
            return Ok(());
        };
        let Some(block) = self.live.remove(&addr) else {
            return Ok(());
        };
        trace!("release {} bytes at {addr:#x}", block.size);

        let corrupted = block.first_corrupted();
        unsafe { self.heap.release(block.ptr) };
        self.stats.releases += 1;
        if let Some(offset) = corrupted {
            return CorruptedSnafu {
                worker: self.id,
                addr,
                offset,
            }
            .fail();
        }
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        for block in self.live.values() {
            unsafe { self.heap.release(block.ptr) };
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn config(threads: usize) -> Config {
        Config {
            threads,
            iterations: 500,
            max_size: 8192,
            seed: 42,
        }
    }

    #[test]
    fn test_single_worker() {
        let summary = run(&config(1)).unwrap();
        assert_eq!(summary.threads, 1);
        assert_eq!(summary.allocations, summary.releases);
        assert!(summary.allocations > 0);
    }

    #[test]
    fn test_many_workers() {
        let summary = run(&config(8)).unwrap();
        assert_eq!(summary.threads, 8);
        assert_eq!(summary.allocations, summary.releases);
        assert!(summary.peak_live >= 1);
    }

    #[test]
    fn test_same_seed_same_work() {
        let first = run(&config(2)).unwrap();
        let second = run(&config(2)).unwrap();
        assert_eq!(first.allocations, second.allocations);
        assert_eq!(first.bytes, second.bytes);
    }

    #[test]
    fn test_corruption_is_reported() {
        let mut worker = Worker::new(3);
        worker.allocate(64, 16, 0xAA).unwrap();
        let addr = *worker.live.keys().next().unwrap();
        unsafe { worker.live[&addr].ptr.add(10).write(0) };

        let err = worker.release_nth(0).unwrap_err();
        assert!(matches!(
            err,
            WorkloadError::Corrupted {
                worker: 3,
                offset: 10,
                ..
            }
        ));
        assert!(worker.live.is_empty());
    }

    #[test]
    fn test_allocation_failure_is_reported() {
        let mut worker = Worker::new(0);
        let err = worker.allocate(usize::MAX - 8, 8, 1).unwrap_err();
        assert!(matches!(err, WorkloadError::Allocate { size, .. } if size == usize::MAX - 8));
    }
}
