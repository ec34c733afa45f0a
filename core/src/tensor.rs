/// Tensor buffers, per-head views, scratch storage and the serial reference kernels.
///
/// Everything is a flat row-major slice with explicit dimensions. The serial
/// kernels here compute one contiguous block of output rows; `kernels.rs`
/// fans those blocks out over the worker pool.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{MhsaError, Result};
use crate::model::MhsaConfig;
use crate::real::Real;

/// Row-major 2-D buffer with an optional same-shaped gradient.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor<T> {
    pub data: Vec<T>,
    pub diff: Option<Vec<T>>,
    rows: usize,
    cols: usize,
}

impl<T: Real> Tensor<T> {
    /// Zero-filled tensor outside the gradient flow.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Tensor {
            data: vec![T::zero(); rows * cols],
            diff: None,
            rows,
            cols,
        }
    }

    /// Zero-filled tensor with a zeroed gradient buffer.
    pub fn trainable(rows: usize, cols: usize) -> Self {
        Self::zeros(rows, cols).with_grad()
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(MhsaError::BadLength {
                tensor: "data",
                rows,
                cols,
                actual: data.len(),
            });
        }
        Ok(Tensor {
            data,
            diff: None,
            rows,
            cols,
        })
    }

    /// Attach a zeroed gradient buffer if none is present.
    pub fn with_grad(mut self) -> Self {
        if self.diff.is_none() {
            self.diff = Some(vec![T::zero(); self.data.len()]);
        }
        self
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn grad(&self) -> Option<&[T]> {
        self.diff.as_deref()
    }

    pub fn grad_mut(&mut self) -> Option<&mut [T]> {
        self.diff.as_deref_mut()
    }

    pub fn zero_grad(&mut self) {
        if let Some(d) = self.diff.as_mut() {
            d.iter_mut().for_each(|v| *v = T::zero());
        }
    }

    /// Check shape, and the gradient buffer when `need_grad` is set.
    pub(crate) fn ensure(
        &self,
        name: &'static str,
        rows: usize,
        cols: usize,
        need_grad: bool,
    ) -> Result<()> {
        if self.shape() != (rows, cols) {
            return Err(MhsaError::ShapeMismatch {
                tensor: name,
                expected: (rows, cols),
                actual: self.shape(),
            });
        }
        if self.data.len() != rows * cols {
            return Err(MhsaError::BadLength {
                tensor: name,
                rows,
                cols,
                actual: self.data.len(),
            });
        }
        if need_grad {
            match &self.diff {
                None => return Err(MhsaError::MissingGradient { tensor: name }),
                Some(d) if d.len() != self.data.len() => {
                    return Err(MhsaError::BadLength {
                        tensor: name,
                        rows,
                        cols,
                        actual: d.len(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Borrow `data` and `diff` at once.
    pub(crate) fn split_mut(&mut self, name: &'static str) -> Result<(&[T], &mut [T])> {
        match self.diff.as_deref_mut() {
            Some(d) => Ok((&self.data, d)),
            None => Err(MhsaError::MissingGradient { tensor: name }),
        }
    }

    /// Gradient buffer, or `MissingGradient` naming the tensor.
    pub(crate) fn diff_of(&self, name: &'static str) -> Result<&[T]> {
        self.diff
            .as_deref()
            .ok_or(MhsaError::MissingGradient { tensor: name })
    }
}

// ── Per-head views ───────────────────────────────────────────────────

/// Strided accessor over `heads` equal contiguous blocks of a flat buffer.
///
/// Q/K/V/attention_map use `stride = H*L`; the softmax buffer uses `L*L`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadView {
    heads: usize,
    stride: usize,
}

impl HeadView {
    pub fn new(len: usize, heads: usize, stride: usize) -> Result<Self> {
        if heads == 0 || stride == 0 || heads * stride != len {
            return Err(MhsaError::BadHeadView { len, heads, stride });
        }
        Ok(HeadView { heads, stride })
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Element range of head `i`, for `i < heads`.
    pub fn range(&self, i: usize) -> Range<usize> {
        debug_assert!(i < self.heads, "head {i} out of {}", self.heads);
        i * self.stride..(i + 1) * self.stride
    }

    pub fn head<'a, T>(&self, buf: &'a [T], i: usize) -> &'a [T] {
        debug_assert_eq!(buf.len(), self.heads * self.stride);
        &buf[self.range(i)]
    }

    pub fn head_mut<'a, T>(&self, buf: &'a mut [T], i: usize) -> &'a mut [T] {
        debug_assert_eq!(buf.len(), self.heads * self.stride);
        let r = self.range(i);
        &mut buf[r]
    }
}

// ── Scratch ──────────────────────────────────────────────────────────

/// Reusable intermediates. Holds no state between steps: each use fully
/// overwrites the region it reads back.
#[derive(Clone, Debug)]
pub struct Scratch<T> {
    /// Transposes and matmul staging. `max(F*E, F*L, L*L, E*L)` elements.
    pub temp: Vec<T>,
    /// Softmax input gradient, `L*L`.
    pub grad: Vec<T>,
    /// Per-row maxima, `L`.
    pub maxes: Vec<T>,
    /// Per-row sums (forward) or `y·dy` dots (backward), `L`.
    pub sums: Vec<T>,
}

impl<T: Real> Scratch<T> {
    pub fn for_config(cfg: &MhsaConfig) -> Self {
        Scratch {
            temp: vec![T::zero(); cfg.temp_len()],
            grad: vec![T::zero(); cfg.seq_len * cfg.seq_len],
            maxes: vec![T::zero(); cfg.seq_len],
            sums: vec![T::zero(); cfg.seq_len],
        }
    }

    pub fn validate(&self, cfg: &MhsaConfig) -> Result<()> {
        let l = cfg.seq_len;
        for (buffer, required, actual) in [
            ("temp", cfg.temp_len(), self.temp.len()),
            ("grad", l * l, self.grad.len()),
            ("maxes", l, self.maxes.len()),
            ("sums", l, self.sums.len()),
        ] {
            if actual < required {
                return Err(MhsaError::ScratchTooSmall {
                    buffer,
                    required,
                    actual,
                });
            }
        }
        Ok(())
    }
}

// ── Serial reference kernels ─────────────────────────────────────────
//
// Each kernel writes a block of output rows starting at `first`. The
// parallel executor hands every worker one block; a single call with
// `first = 0` over the whole output is the serial reference.

/// Transpose `src` (`rows × cols`) into rows `first..` of `dst` (`cols × rows`).
pub fn transpose_rows<T: Real>(src: &[T], dst: &mut [T], rows: usize, cols: usize, first: usize) {
    debug_assert_eq!(src.len(), rows * cols);
    debug_assert_eq!(dst.len() % rows.max(1), 0);
    for (r, out_row) in dst.chunks_mut(rows).enumerate() {
        let j = first + r;
        for (i, v) in out_row.iter_mut().enumerate() {
            *v = src[i * cols + j];
        }
    }
}

/// Full transpose: `dst[j][i] = src[i][j]`.
pub fn transpose<T: Real>(src: &[T], dst: &mut [T], rows: usize, cols: usize) {
    debug_assert_eq!(dst.len(), rows * cols);
    transpose_rows(src, dst, rows, cols, 0);
}

/// Row-wise stable softmax of a block of `cols`-wide rows.
///
/// `maxes`/`sums` receive each row's maximum and exponential sum.
pub fn softmax_rows<T: Real>(
    input: &[T],
    output: &mut [T],
    maxes: &mut [T],
    sums: &mut [T],
    cols: usize,
) {
    debug_assert_eq!(input.len(), output.len());
    debug_assert_eq!(maxes.len() * cols, output.len());
    debug_assert_eq!(sums.len(), maxes.len());
    for (r, (x, y)) in input.chunks(cols).zip(output.chunks_mut(cols)).enumerate() {
        let max = x.iter().fold(T::neg_infinity(), |m, &v| m.max(v));
        let mut sum = T::zero();
        for (o, &v) in y.iter_mut().zip(x) {
            *o = (v - max).exp();
            sum = sum + *o;
        }
        for o in y.iter_mut() {
            *o = *o / sum;
        }
        maxes[r] = max;
        sums[r] = sum;
    }
}

/// Row-wise softmax backward: `dx_j = y_j * (dy_j - Σ_k y_k dy_k)`.
///
/// `dots` receives each row's `Σ_k y_k dy_k`.
pub fn softmax_rows_grad<T: Real>(
    output: &[T],
    output_grad: &[T],
    input_grad: &mut [T],
    dots: &mut [T],
    cols: usize,
) {
    debug_assert_eq!(output.len(), output_grad.len());
    debug_assert_eq!(input_grad.len(), output.len());
    debug_assert_eq!(dots.len() * cols, output.len());
    let rows = output.chunks(cols).zip(output_grad.chunks(cols));
    for (r, ((y, dy), dx)) in rows.zip(input_grad.chunks_mut(cols)).enumerate() {
        let dot = y.iter().zip(dy).fold(T::zero(), |acc, (&a, &b)| acc + a * b);
        for ((g, &a), &b) in dx.iter_mut().zip(y).zip(dy) {
            *g = a * (b - dot);
        }
        dots[r] = dot;
    }
}

/// Add `bias[r]` to every element of row `r`.
pub fn add_row_bias<T: Real>(mat: &mut [T], bias: &[T], cols: usize) {
    debug_assert_eq!(mat.len(), bias.len() * cols);
    for (row, &b) in mat.chunks_mut(cols).zip(bias) {
        for v in row.iter_mut() {
            *v = *v + b;
        }
    }
}

/// `out[r] = Σ_c mat[r][c]`, summed left to right.
pub fn row_sums<T: Real>(mat: &[T], out: &mut [T], cols: usize) {
    debug_assert_eq!(mat.len(), out.len() * cols);
    for (o, row) in out.iter_mut().zip(mat.chunks(cols)) {
        *o = crate::real::sum(row);
    }
}

// ── Deterministic init ───────────────────────────────────────────────

/// Xorshift64 generator for reproducible weight init.
pub struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    pub fn new(seed: u64) -> Self {
        SimpleRng { state: seed.max(1) } // avoid zero state
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// Uniform in [-scale, scale].
    pub fn uniform(&mut self, scale: f64) -> f64 {
        let u = (self.next_u64() as f64) / (u64::MAX as f64);
        (2.0 * u - 1.0) * scale
    }

    pub fn fill_uniform<T: Real>(&mut self, buf: &mut [T], scale: f64) {
        for v in buf.iter_mut() {
            *v = T::cast(self.uniform(scale));
        }
    }
}
