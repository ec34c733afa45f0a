/// Parallel elementary ops used by the MHSA engines.
///
/// Each method is one fork-join dispatch: the output is split into row
/// blocks over the worker pool and the call returns after every block is
/// written.

use rayon::prelude::*;

use crate::dispatch::{KernelRegistry, LayerKind, MatmulShape, PassKind};
use crate::error::Result;
use crate::model::ExecConfig;
use crate::parallel::{block_len, WorkerPool};
use crate::real::Real;
use crate::tensor;

pub struct Executor<T: Real> {
    pool: WorkerPool,
    registry: KernelRegistry<T>,
    config: ExecConfig,
}

impl<T: Real> Executor<T> {
    pub fn new(config: ExecConfig) -> Result<Self> {
        Ok(Executor {
            pool: WorkerPool::new(config.workers)?,
            registry: KernelRegistry::new(),
            config,
        })
    }

    /// Use a caller-populated registry instead of the built-in one.
    pub fn with_registry(config: ExecConfig, registry: KernelRegistry<T>) -> Result<Self> {
        Ok(Executor {
            pool: WorkerPool::new(config.workers)?,
            registry,
            config,
        })
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn workers(&self) -> usize {
        self.pool.workers()
    }

    pub fn registry_mut(&mut self) -> &mut KernelRegistry<T> {
        &mut self.registry
    }

    /// Attention scale shared by forward and backward.
    pub fn attention_scale(&self, head_dim: usize) -> T {
        self.config.scaling.factor(head_dim)
    }

    /// `dst (cols×rows) = srcᵀ` for `src (rows×cols)`.
    pub fn transpose(&self, src: &[T], dst: &mut [T], rows: usize, cols: usize) {
        debug_assert_eq!(src.len(), rows * cols);
        debug_assert_eq!(dst.len(), rows * cols);
        self.pool.fork_rows(dst, rows, |first, block| {
            tensor::transpose_rows(src, block, rows, cols, first);
        });
    }

    /// Transpose `buf` in place through `temp`: transpose into scratch, copy back.
    pub fn transpose_in_place(&self, buf: &mut [T], temp: &mut [T], rows: usize, cols: usize) {
        let n = rows * cols;
        self.transpose(buf, &mut temp[..n], rows, cols);
        self.copy(&temp[..n], buf);
    }

    pub fn matmul(
        &self,
        layer: LayerKind,
        pass: PassKind,
        a: &[T],
        b: &[T],
        out: &mut [T],
        shape: MatmulShape,
    ) {
        debug_assert_eq!(a.len(), shape.n * shape.k);
        debug_assert_eq!(b.len(), shape.k * shape.m);
        debug_assert_eq!(out.len(), shape.n * shape.m);
        let kernel = self.registry.select(layer, pass, &self.config.matmul, &shape);
        self.pool.fork_rows(out, shape.m, |first, block| {
            kernel.compute_rows(a, b, block, &shape, first);
        });
    }

    /// Row softmax of `input` into `output`, recording row maxima and sums.
    pub fn softmax_rows(
        &self,
        input: &[T],
        output: &mut [T],
        maxes: &mut [T],
        sums: &mut [T],
        rows: usize,
        cols: usize,
    ) {
        debug_assert_eq!(input.len(), rows * cols);
        let (output, maxes, sums) = (&mut output[..rows * cols], &mut maxes[..rows], &mut sums[..rows]);
        if self.pool.workers() == 1 || rows <= 1 {
            tensor::softmax_rows(input, output, maxes, sums, cols);
            return;
        }
        let block = block_len(rows, self.pool.workers());
        self.pool.install(|| {
            output
                .par_chunks_mut(block * cols)
                .zip(maxes.par_chunks_mut(block))
                .zip(sums.par_chunks_mut(block))
                .enumerate()
                .for_each(|(i, ((out, mx), sm))| {
                    let start = i * block * cols;
                    let x = &input[start..start + out.len()];
                    tensor::softmax_rows(x, out, mx, sm, cols);
                });
        });
    }

    /// Row softmax backward: `input_grad = y ⊙ (dy − rowdot(y, dy))`.
    pub fn softmax_rows_grad(
        &self,
        output: &[T],
        output_grad: &[T],
        input_grad: &mut [T],
        dots: &mut [T],
        rows: usize,
        cols: usize,
    ) {
        debug_assert_eq!(output.len(), rows * cols);
        let input_grad = &mut input_grad[..rows * cols];
        self.pool
            .fork_rows_with(input_grad, &mut dots[..rows], cols, |first, block, d| {
                let span = first * cols..first * cols + block.len();
                tensor::softmax_rows_grad(&output[span.clone()], &output_grad[span], block, d, cols);
            });
    }

    /// Add `bias[r]` to every element of row `r` of `mat`.
    pub fn add_row_bias(&self, mat: &mut [T], bias: &[T], cols: usize) {
        self.pool.fork_rows(mat, cols, |first, block| {
            let rows = block.len() / cols;
            tensor::add_row_bias(block, &bias[first..first + rows], cols);
        });
    }

    /// `out[r] = Σ_c mat[r][c]`.
    pub fn row_sums(&self, mat: &[T], out: &mut [T], cols: usize) {
        self.pool.fork_rows(out, 1, |first, block| {
            let span = first * cols..(first + block.len()) * cols;
            tensor::row_sums(&mat[span], block, cols);
        });
    }

    pub fn scale(&self, buf: &mut [T], factor: T) {
        self.pool.fork_rows(buf, 1, |_, block| {
            for v in block.iter_mut() {
                *v = *v * factor;
            }
        });
    }

    /// `dst += src`.
    pub fn add_assign(&self, dst: &mut [T], src: &[T]) {
        debug_assert_eq!(dst.len(), src.len());
        self.pool.fork_rows(dst, 1, |first, block| {
            for (d, &s) in block.iter_mut().zip(&src[first..]) {
                *d = *d + s;
            }
        });
    }

    pub fn copy(&self, src: &[T], dst: &mut [T]) {
        debug_assert_eq!(dst.len(), src.len());
        self.pool.fork_rows(dst, 1, |first, block| {
            let n = block.len();
            block.copy_from_slice(&src[first..first + n]);
        });
    }

    pub fn fill(&self, dst: &mut [T], value: T) {
        self.pool.fork_rows(dst, 1, |_, block| {
            block.iter_mut().for_each(|v| *v = value);
        });
    }
}

impl<T: Real> std::fmt::Debug for Executor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish()
    }
}
