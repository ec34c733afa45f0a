/// Fork-join execution over a fixed set of workers.
///
/// Every elementary op splits its output into at most `workers` contiguous
/// blocks (`partition`), runs one block per worker and returns only when all
/// blocks are done. Block boundaries never change per-element arithmetic, so
/// results are identical for every worker count.

use std::ops::Range;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::error::{MhsaError, Result};

/// Rows per block when `len` rows are split across `workers`: ceil(len / workers).
pub fn block_len(len: usize, workers: usize) -> usize {
    len.div_ceil(workers.max(1)).max(1)
}

/// Range of rows owned by worker `id`. Trailing workers may get an empty range.
pub fn partition(len: usize, workers: usize, id: usize) -> Range<usize> {
    let block = block_len(len, workers);
    let start = (id * block).min(len);
    let end = (start + block).min(len);
    start..end
}

/// Fixed-size worker pool.
pub struct WorkerPool {
    pool: Option<ThreadPool>,
    workers: usize,
}

impl WorkerPool {
    /// One worker runs every op inline on the caller's thread.
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(MhsaError::ZeroWorkers);
        }
        let pool = if workers > 1 {
            let pool = ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("mhsa-worker-{i}"))
                .build()
                .map_err(|e| MhsaError::WorkerPool(e.to_string()))?;
            Some(pool)
        } else {
            None
        };
        debug!(workers, "worker pool ready");
        Ok(WorkerPool { pool, workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `f` inside the pool so nested rayon iterators use its threads.
    pub fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }

    /// Split `out` into row blocks of `row_len` elements and call
    /// `f(first_row, block)` for each, one block per worker. Blocks until done.
    pub fn fork_rows<T, F>(&self, out: &mut [T], row_len: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Send + Sync,
    {
        if out.is_empty() || row_len == 0 {
            return;
        }
        let rows = out.len() / row_len;
        if self.pool.is_none() || rows <= 1 {
            f(0, out);
            return;
        }
        let block = block_len(rows, self.workers);
        self.install(|| {
            out.par_chunks_mut(block * row_len)
                .enumerate()
                .for_each(|(i, chunk)| f(i * block, chunk));
        });
    }

    /// Row-partitioned dispatch over an output and a per-row side buffer
    /// (e.g. softmax rows plus their maxima).
    pub fn fork_rows_with<T, U, F>(&self, out: &mut [T], side: &mut [U], row_len: usize, f: F)
    where
        T: Send,
        U: Send,
        F: Fn(usize, &mut [T], &mut [U]) + Send + Sync,
    {
        if out.is_empty() || row_len == 0 {
            return;
        }
        let rows = out.len() / row_len;
        let side_per_row = side.len() / rows.max(1);
        if self.pool.is_none() || rows <= 1 {
            f(0, out, side);
            return;
        }
        let block = block_len(rows, self.workers);
        self.install(|| {
            out.par_chunks_mut(block * row_len)
                .zip(side.par_chunks_mut((block * side_per_row).max(1)))
                .enumerate()
                .for_each(|(i, (chunk, s))| f(i * block, chunk, s));
        });
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .finish()
    }
}
