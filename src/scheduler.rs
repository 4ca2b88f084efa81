//! Bounded chunked fan-out of leaf work
//!
//! Items of one directory run in fixed-size chunks. Every item of a chunk
//! is polled concurrently on the current task, and the next chunk starts
//! only after the whole chunk has settled. The item closure is responsible
//! for catching its own failures; the scheduler never cancels siblings.

use futures::future::join_all;
use std::future::Future;
use tracing::trace;

/// Chunked concurrency for leaf processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyScheduler {
    chunk_size: usize,
}

impl ConcurrencyScheduler {
    /// Scheduler with a fixed chunk size (at least 1)
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Chunk size of host parallelism minus one
    pub fn from_host() -> Self {
        Self::new(num_cpus::get().saturating_sub(1))
    }

    /// Items dispatched per chunk
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Run `task` over every item, one chunk at a time
    ///
    /// Results come back in input order regardless of completion order.
    pub async fn run<T, R, F, Fut>(&self, items: Vec<T>, mut task: F) -> Vec<R>
    where
        F: FnMut(T) -> Fut,
        Fut: Future<Output = R>,
    {
        let total = items.len();
        let mut results = Vec::with_capacity(total);
        let mut remaining = items.into_iter().peekable();
        let mut chunk_no = 0;

        while remaining.peek().is_some() {
            let chunk: Vec<Fut> = remaining.by_ref().take(self.chunk_size).map(&mut task).collect();
            chunk_no += 1;
            trace!("Dispatching chunk {} ({} items)", chunk_no, chunk.len());
            results.extend(join_all(chunk).await);
        }

        trace!("Settled {} items in {} chunks", total, chunk_no);
        results
    }
}

impl Default for ConcurrencyScheduler {
    fn default() -> Self {
        Self::from_host()
    }
}
