/// Asynchronous copies between slow memory (the caller's tensors) and the
/// fast-memory working set of the tiled forward pass.
///
/// A buffer handed to `load`/`store` is moved into the transfer and only
/// comes back from `Transfer::wait`, so compute can never touch a slot that
/// is still in flight. In threaded mode each transfer runs on a scoped
/// thread; inline mode copies synchronously and is used on single-core
/// targets and to check that overlap does not change results.

use std::thread::{Scope, ScopedJoinHandle};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{MhsaError, Result};
use crate::real::Real;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferMode {
    /// Copies overlap compute on scoped transfer threads.
    #[default]
    Threaded,
    /// Copies complete before `load`/`store` returns.
    Inline,
}

/// 2-D strided source region: element `(r, c)` is
/// `data[offset + r * row_stride + c * col_stride]`.
#[derive(Clone, Copy, Debug)]
pub struct Strided<'a, T> {
    data: &'a [T],
    offset: usize,
    rows: usize,
    cols: usize,
    row_stride: usize,
    col_stride: usize,
}

impl<'a, T: Real> Strided<'a, T> {
    pub fn new(
        data: &'a [T],
        offset: usize,
        rows: usize,
        cols: usize,
        row_stride: usize,
        col_stride: usize,
    ) -> Self {
        debug_assert!(
            rows == 0
                || cols == 0
                || offset + (rows - 1) * row_stride + (cols - 1) * col_stride < data.len()
        );
        Strided {
            data,
            offset,
            rows,
            cols,
            row_stride,
            col_stride,
        }
    }

    /// The whole slice as one row.
    pub fn contiguous(data: &'a [T]) -> Self {
        Strided::new(data, 0, 1, data.len(), data.len(), 1)
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn gather_into(&self, dst: &mut [T]) {
        debug_assert_eq!(dst.len(), self.len());
        if self.col_stride == 1 {
            for (r, row) in dst.chunks_mut(self.cols).enumerate() {
                let start = self.offset + r * self.row_stride;
                row.copy_from_slice(&self.data[start..start + self.cols]);
            }
            return;
        }
        for (r, row) in dst.chunks_mut(self.cols).enumerate() {
            let base = self.offset + r * self.row_stride;
            for (c, v) in row.iter_mut().enumerate() {
                *v = self.data[base + c * self.col_stride];
            }
        }
    }
}

fn gather_all<T: Real>(segments: &[Strided<'_, T>], dst: &mut [T]) {
    let mut at = 0;
    for seg in segments {
        let n = seg.len();
        seg.gather_into(&mut dst[at..at + n]);
        at += n;
    }
}

fn scatter_all<T: Real>(src: &[T], dsts: &mut [&mut [T]]) {
    let mut at = 0;
    for d in dsts.iter_mut() {
        let n = d.len();
        d.copy_from_slice(&src[at..at + n]);
        at += n;
    }
}

/// Handle to a buffer that is, or was, being copied.
pub enum Transfer<'scope, T> {
    Done(Vec<T>),
    InFlight(ScopedJoinHandle<'scope, Vec<T>>),
}

impl<T> Transfer<'_, T> {
    /// Block until the copy is complete and take the buffer back.
    pub fn wait(self) -> Result<Vec<T>> {
        match self {
            Transfer::Done(buf) => Ok(buf),
            Transfer::InFlight(handle) => handle.join().map_err(|_| MhsaError::TransferFailed),
        }
    }
}

/// Transfer engine bound to a thread scope (threaded) or to none (inline).
pub struct Dma<'scope, 'env> {
    scope: Option<&'scope Scope<'scope, 'env>>,
}

impl<'scope, 'env> Dma<'scope, 'env> {
    pub fn inline() -> Self {
        Dma { scope: None }
    }

    pub fn threaded(scope: &'scope Scope<'scope, 'env>) -> Self {
        Dma { scope: Some(scope) }
    }

    pub fn for_mode(mode: TransferMode, scope: &'scope Scope<'scope, 'env>) -> Self {
        match mode {
            TransferMode::Threaded => Self::threaded(scope),
            TransferMode::Inline => Self::inline(),
        }
    }

    /// Gather `segments` back to back into `dst`.
    pub fn load<T: Real>(&self, mut dst: Vec<T>, segments: Vec<Strided<'env, T>>) -> Transfer<'scope, T> {
        let total: usize = segments.iter().map(Strided::len).sum();
        debug_assert!(total <= dst.len());
        trace!(elems = total, "load issued");
        match self.scope {
            None => {
                gather_all(&segments, &mut dst[..total]);
                Transfer::Done(dst)
            }
            Some(scope) => Transfer::InFlight(scope.spawn(move || {
                gather_all(&segments, &mut dst[..total]);
                dst
            })),
        }
    }

    /// Scatter consecutive chunks of `src` into `dsts`.
    pub fn store<T: Real>(&self, src: Vec<T>, mut dsts: Vec<&'env mut [T]>) -> Transfer<'scope, T> {
        let total: usize = dsts.iter().map(|d| d.len()).sum();
        debug_assert!(total <= src.len());
        trace!(elems = total, "store issued");
        match self.scope {
            None => {
                scatter_all(&src, &mut dsts);
                Transfer::Done(src)
            }
            Some(scope) => Transfer::InFlight(scope.spawn(move || {
                scatter_all(&src, &mut dsts);
                src
            })),
        }
    }
}
