//! Work-stealing worker pool.
//!
//! Implements Heijunka (load leveling) for tasks of uneven duration: large
//! sample-size conditions take far longer than small ones, so idle workers
//! steal queued tasks instead of waiting on the slowest worker.
//!
//! Tasks are identified by index. Results are re-sorted by index after the
//! join, so callers always see task order regardless of completion order.

use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use std::sync::{Mutex, PoisonError};

/// Fixed-size pool of scoped worker threads.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    /// Number of worker threads.
    num_workers: usize,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    /// Create with default number of workers (number of CPUs).
    #[must_use]
    pub fn new() -> Self {
        Self {
            num_workers: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4),
        }
    }

    /// Create with specified number of workers (at least one).
    #[must_use]
    pub fn with_workers(num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
        }
    }

    /// Get number of workers.
    #[must_use]
    pub const fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Run `run(i)` for every `i in 0..n_tasks` and return the results in
    /// index order.
    ///
    /// With one worker (or one task) everything runs on the calling thread.
    pub fn execute<F, R>(&self, n_tasks: usize, run: F) -> Vec<R>
    where
        F: Fn(usize) -> R + Sync,
        R: Send,
    {
        if self.num_workers == 1 || n_tasks <= 1 {
            return (0..n_tasks).map(run).collect();
        }

        let injector: Injector<usize> = Injector::new();
        for index in 0..n_tasks {
            injector.push(index);
        }

        let workers: Vec<Worker<usize>> = (0..self.num_workers.min(n_tasks))
            .map(|_| Worker::new_fifo())
            .collect();
        let stealers: Vec<Stealer<usize>> = workers.iter().map(Worker::stealer).collect();

        let results: Mutex<Vec<(usize, R)>> = Mutex::new(Vec::with_capacity(n_tasks));

        std::thread::scope(|s| {
            for (worker_id, worker) in workers.into_iter().enumerate() {
                let injector = &injector;
                let stealers = &stealers;
                let results = &results;
                let run = &run;

                s.spawn(move || {
                    while let Some(index) = find_task(worker_id, &worker, injector, stealers) {
                        let result = run(index);
                        results
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push((index, result));
                    }
                });
            }
        });

        let mut indexed = results.into_inner().unwrap_or_else(PoisonError::into_inner);
        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, r)| r).collect()
    }
}

/// Local queue first, then a batch from the global queue, then the other
/// workers round-robin.
fn find_task(
    worker_id: usize,
    local: &Worker<usize>,
    injector: &Injector<usize>,
    stealers: &[Stealer<usize>],
) -> Option<usize> {
    if let Some(task) = local.pop() {
        return Some(task);
    }

    loop {
        match injector.steal_batch_and_pop(local) {
            Steal::Success(task) => return Some(task),
            Steal::Empty => break,
            Steal::Retry => {}
        }
    }

    for offset in 1..=stealers.len() {
        let victim = &stealers[(worker_id + offset) % stealers.len()];
        loop {
            match victim.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
    }
    None
}
