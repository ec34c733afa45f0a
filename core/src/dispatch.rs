/// Runtime matmul strategy selection.
///
/// `MatmulPreference` maps every `(LayerKind, PassKind)` pair to an
/// algorithm id; the registry resolves that id to a strategy. A missing id,
/// or a strategy that rejects the shape, falls back to `NAIVE`.
///
/// Every strategy accumulates each output element over the inner dimension
/// in ascending order, starting from zero, with a separate multiply and add.
/// Selection changes speed only: all strategies are bit-identical.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::real::Real;

/// Registry id of a matmul strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatmulAlgo(pub u16);

pub const NAIVE: MatmulAlgo = MatmulAlgo(0);
pub const UNROLL_1X4: MatmulAlgo = MatmulAlgo(1);
pub const UNROLL_2X2: MatmulAlgo = MatmulAlgo(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerKind {
    /// Q/K/V input projections and the output projection.
    Linear,
    /// Per-head score and value products.
    Attention,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PassKind {
    Forward,
    WeightGrad,
    InputGrad,
}

// ── Preferences ──────────────────────────────────────────────────────

/// Preferred strategy for each pass of one layer kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassAlgos {
    pub forward: MatmulAlgo,
    pub weight_grad: MatmulAlgo,
    pub input_grad: MatmulAlgo,
}

impl PassAlgos {
    pub fn uniform(algo: MatmulAlgo) -> Self {
        PassAlgos {
            forward: algo,
            weight_grad: algo,
            input_grad: algo,
        }
    }

    pub fn get(&self, pass: PassKind) -> MatmulAlgo {
        match pass {
            PassKind::Forward => self.forward,
            PassKind::WeightGrad => self.weight_grad,
            PassKind::InputGrad => self.input_grad,
        }
    }

    fn get_mut(&mut self, pass: PassKind) -> &mut MatmulAlgo {
        match pass {
            PassKind::Forward => &mut self.forward,
            PassKind::WeightGrad => &mut self.weight_grad,
            PassKind::InputGrad => &mut self.input_grad,
        }
    }
}

/// Preferred strategy per `(LayerKind, PassKind)`. Defaults to `NAIVE`
/// everywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatmulPreference {
    pub linear: PassAlgos,
    pub attention: PassAlgos,
}

impl Default for MatmulPreference {
    fn default() -> Self {
        MatmulPreference::uniform(NAIVE)
    }
}

impl MatmulPreference {
    /// Same strategy for every layer kind and pass.
    pub fn uniform(algo: MatmulAlgo) -> Self {
        MatmulPreference {
            linear: PassAlgos::uniform(algo),
            attention: PassAlgos::uniform(algo),
        }
    }

    pub fn layer(&self, layer: LayerKind) -> &PassAlgos {
        match layer {
            LayerKind::Linear => &self.linear,
            LayerKind::Attention => &self.attention,
        }
    }

    pub fn get(&self, layer: LayerKind, pass: PassKind) -> MatmulAlgo {
        self.layer(layer).get(pass)
    }

    /// Override one `(layer, pass)` entry.
    pub fn with(mut self, layer: LayerKind, pass: PassKind, algo: MatmulAlgo) -> Self {
        let passes = match layer {
            LayerKind::Linear => &mut self.linear,
            LayerKind::Attention => &mut self.attention,
        };
        *passes.get_mut(pass) = algo;
        self
    }

    /// Override every pass of one layer kind.
    pub fn with_layer(mut self, layer: LayerKind, algo: MatmulAlgo) -> Self {
        match layer {
            LayerKind::Linear => self.linear = PassAlgos::uniform(algo),
            LayerKind::Attention => self.attention = PassAlgos::uniform(algo),
        }
        self
    }
}

/// `out[n×m] = A[n×k] · B[k×m]`, or `A · Bᵀ` with `B` stored `m×k`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatmulShape {
    pub n: usize,
    pub k: usize,
    pub m: usize,
    pub transpose_b: bool,
}

impl MatmulShape {
    pub fn new(n: usize, k: usize, m: usize) -> Self {
        MatmulShape {
            n,
            k,
            m,
            transpose_b: false,
        }
    }

    pub fn transposed_b(n: usize, k: usize, m: usize) -> Self {
        MatmulShape {
            n,
            k,
            m,
            transpose_b: true,
        }
    }

    /// Element `B[p][j]` in the stored layout.
    #[inline]
    fn b_index(&self, p: usize, j: usize) -> usize {
        if self.transpose_b {
            j * self.k + p
        } else {
            p * self.m + j
        }
    }
}

/// A matmul strategy over a block of output rows.
pub trait MatmulKernel<T: Real>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this strategy handles `shape`.
    fn supports(&self, shape: &MatmulShape) -> bool;

    /// Compute output rows `first..first + out.len() / m`. `a` and `b` are
    /// the full operands.
    fn compute_rows(&self, a: &[T], b: &[T], out: &mut [T], shape: &MatmulShape, first: usize);
}

/// One dot product per output element.
pub struct NaiveMatmul;

impl<T: Real> MatmulKernel<T> for NaiveMatmul {
    fn name(&self) -> &'static str {
        "naive"
    }

    fn supports(&self, _shape: &MatmulShape) -> bool {
        true
    }

    fn compute_rows(&self, a: &[T], b: &[T], out: &mut [T], s: &MatmulShape, first: usize) {
        for (r, out_row) in out.chunks_mut(s.m).enumerate() {
            let a_row = &a[(first + r) * s.k..(first + r + 1) * s.k];
            for (j, o) in out_row.iter_mut().enumerate() {
                let mut acc = T::zero();
                for (p, &x) in a_row.iter().enumerate() {
                    acc = acc + x * b[s.b_index(p, j)];
                }
                *o = acc;
            }
        }
    }
}

/// Four output columns per pass over the `a` row. Requires `m >= 4`;
/// trailing columns use the scalar loop.
pub struct Unroll1x4Matmul;

impl<T: Real> MatmulKernel<T> for Unroll1x4Matmul {
    fn name(&self) -> &'static str {
        "unroll_1x4"
    }

    fn supports(&self, shape: &MatmulShape) -> bool {
        shape.m >= 4
    }

    fn compute_rows(&self, a: &[T], b: &[T], out: &mut [T], s: &MatmulShape, first: usize) {
        let main = s.m - s.m % 4;
        for (r, out_row) in out.chunks_mut(s.m).enumerate() {
            let a_row = &a[(first + r) * s.k..(first + r + 1) * s.k];
            let mut j = 0;
            while j < main {
                let mut acc = [T::zero(); 4];
                for (p, &x) in a_row.iter().enumerate() {
                    for (c, slot) in acc.iter_mut().enumerate() {
                        *slot = *slot + x * b[s.b_index(p, j + c)];
                    }
                }
                out_row[j..j + 4].copy_from_slice(&acc);
                j += 4;
            }
            for (jj, o) in out_row.iter_mut().enumerate().skip(main) {
                let mut acc = T::zero();
                for (p, &x) in a_row.iter().enumerate() {
                    acc = acc + x * b[s.b_index(p, jj)];
                }
                *o = acc;
            }
        }
    }
}

/// 2×2 register block: two `a` rows against two `b` columns. Requires even
/// `n` and `m` within the block it is handed.
pub struct Unroll2x2Matmul;

impl<T: Real> MatmulKernel<T> for Unroll2x2Matmul {
    fn name(&self) -> &'static str {
        "unroll_2x2"
    }

    fn supports(&self, shape: &MatmulShape) -> bool {
        shape.n % 2 == 0 && shape.m % 2 == 0
    }

    fn compute_rows(&self, a: &[T], b: &[T], out: &mut [T], s: &MatmulShape, first: usize) {
        let rows = out.len() / s.m;
        let mut r = 0;
        while r + 1 < rows {
            let a0 = &a[(first + r) * s.k..(first + r + 1) * s.k];
            let a1 = &a[(first + r + 1) * s.k..(first + r + 2) * s.k];
            let (top, bottom) = out[r * s.m..(r + 2) * s.m].split_at_mut(s.m);
            let mut j = 0;
            while j + 1 < s.m {
                let (mut c00, mut c01, mut c10, mut c11) = (T::zero(), T::zero(), T::zero(), T::zero());
                for p in 0..s.k {
                    let b0 = b[s.b_index(p, j)];
                    let b1 = b[s.b_index(p, j + 1)];
                    c00 = c00 + a0[p] * b0;
                    c01 = c01 + a0[p] * b1;
                    c10 = c10 + a1[p] * b0;
                    c11 = c11 + a1[p] * b1;
                }
                top[j] = c00;
                top[j + 1] = c01;
                bottom[j] = c10;
                bottom[j + 1] = c11;
                j += 2;
            }
            r += 2;
        }
        // Odd block length from partitioning: finish the last row plainly.
        if r < rows {
            NaiveMatmul.compute_rows(a, b, &mut out[r * s.m..], s, first + r);
        }
    }
}

/// Strategy table with per-pass preferences.
pub struct KernelRegistry<T: Real> {
    kernels: HashMap<MatmulAlgo, Box<dyn MatmulKernel<T>>>,
}

impl<T: Real> KernelRegistry<T> {
    /// Registry holding the built-in strategies.
    pub fn new() -> Self {
        let mut reg = KernelRegistry {
            kernels: HashMap::new(),
        };
        reg.register(NAIVE, Box::new(NaiveMatmul));
        reg.register(UNROLL_1X4, Box::new(Unroll1x4Matmul));
        reg.register(UNROLL_2X2, Box::new(Unroll2x2Matmul));
        reg
    }

    /// Add or replace a strategy. `NAIVE` cannot be replaced.
    pub fn register(&mut self, id: MatmulAlgo, kernel: Box<dyn MatmulKernel<T>>) {
        if id == NAIVE && self.kernels.contains_key(&NAIVE) {
            warn!("refusing to replace the naive matmul fallback");
            return;
        }
        debug!(id = id.0, name = kernel.name(), "registered matmul kernel");
        self.kernels.insert(id, kernel);
    }

    pub fn ids(&self) -> Vec<MatmulAlgo> {
        let mut ids: Vec<_> = self.kernels.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Pick the strategy for one call: the id `prefs` holds for
    /// `(layer, pass)`, or `NAIVE` if that id is unknown or rejects `shape`.
    pub fn select(
        &self,
        layer: LayerKind,
        pass: PassKind,
        prefs: &MatmulPreference,
        shape: &MatmulShape,
    ) -> &dyn MatmulKernel<T> {
        let preferred = prefs.get(layer, pass);
        match self.kernels.get(&preferred) {
            Some(k) if k.supports(shape) => {
                trace!(?layer, ?pass, kernel = k.name(), "matmul selected");
                return k.as_ref();
            }
            Some(k) => {
                warn!(?layer, ?pass, kernel = k.name(), ?shape, "kernel rejects shape, using naive");
            }
            None => {
                warn!(?layer, ?pass, id = preferred.0, "unknown matmul id, using naive");
            }
        }
        &NaiveMatmul
    }
}

impl<T: Real> Default for KernelRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full<K: MatmulKernel<f32>>(k: &K, a: &[f32], b: &[f32], s: MatmulShape) -> Vec<f32> {
        let mut out = vec![0.0f32; s.n * s.m];
        k.compute_rows(a, b, &mut out, &s, 0);
        out
    }

    #[test]
    fn test_naive_2x3_3x2() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0f32];
        let b = [7.0, 8.0, 9.0, 10.0, 11.0, 12.0f32];
        let out = full(&NaiveMatmul, &a, &b, MatmulShape::new(2, 3, 2));
        assert_eq!(out, vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_transposed_b_matches_explicit_transpose() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0f32];
        // Bᵀ stored as 2x3
        let bt = [7.0, 9.0, 11.0, 8.0, 10.0, 12.0f32];
        let out = full(&NaiveMatmul, &a, &bt, MatmulShape::transposed_b(2, 3, 2));
        assert_eq!(out, vec![58.0, 64.0, 139.0, 154.0]);
    }

    #[test]
    fn test_strategies_bit_identical() {
        let mut rng = crate::tensor::SimpleRng::new(7);
        let (n, k, m) = (6, 5, 10);
        let mut a = vec![0.0f32; n * k];
        let mut b = vec![0.0f32; k * m];
        rng.fill_uniform(&mut a, 1.0);
        rng.fill_uniform(&mut b, 1.0);
        for s in [MatmulShape::new(n, k, m), MatmulShape::transposed_b(n, k, 2)] {
            let b = &b[..s.k * s.m];
            let base = full(&NaiveMatmul, &a, b, s);
            if <Unroll1x4Matmul as MatmulKernel<f32>>::supports(&Unroll1x4Matmul, &s) {
                assert_eq!(full(&Unroll1x4Matmul, &a, b, s), base);
            }
            assert_eq!(full(&Unroll2x2Matmul, &a, b, s), base);
        }
    }

    #[test]
    fn test_unroll_2x2_odd_block() {
        // A block of 3 rows handed over by the partitioner.
        let a: Vec<f32> = (0..8).map(|x| x as f32).collect(); // 4x2
        let b = [1.0, 2.0, 3.0, 4.0f32]; // 2x2
        let s = MatmulShape::new(4, 2, 2);
        let mut base = vec![0.0f32; 6];
        NaiveMatmul.compute_rows(&a, &b, &mut base, &s, 1);
        let mut out = vec![0.0f32; 6];
        Unroll2x2Matmul.compute_rows(&a, &b, &mut out, &s, 1);
        assert_eq!(out, base);
    }

    #[test]
    fn test_select_falls_back() {
        let reg = KernelRegistry::<f32>::new();
        let narrow = MatmulShape::new(3, 3, 3);
        let prefs = MatmulPreference::uniform(UNROLL_2X2);
        let k = reg.select(LayerKind::Linear, PassKind::Forward, &prefs, &narrow);
        assert_eq!(k.name(), "naive");
        let prefs = MatmulPreference::uniform(MatmulAlgo(99));
        let k = reg.select(LayerKind::Linear, PassKind::Forward, &prefs, &narrow);
        assert_eq!(k.name(), "naive");
        let wide = MatmulShape::new(4, 3, 8);
        let prefs = MatmulPreference::uniform(UNROLL_1X4);
        let k = reg.select(LayerKind::Attention, PassKind::WeightGrad, &prefs, &wide);
        assert_eq!(k.name(), "unroll_1x4");
    }

    #[test]
    fn test_select_keyed_by_layer_and_pass() {
        let reg = KernelRegistry::<f32>::new();
        let s = MatmulShape::new(4, 3, 8);
        let prefs = MatmulPreference::default()
            .with_layer(LayerKind::Linear, UNROLL_2X2)
            .with(LayerKind::Attention, PassKind::InputGrad, UNROLL_1X4);
        let name = |layer, pass| reg.select(layer, pass, &prefs, &s).name();
        assert_eq!(name(LayerKind::Linear, PassKind::Forward), "unroll_2x2");
        assert_eq!(name(LayerKind::Linear, PassKind::InputGrad), "unroll_2x2");
        assert_eq!(name(LayerKind::Attention, PassKind::Forward), "naive");
        assert_eq!(name(LayerKind::Attention, PassKind::WeightGrad), "naive");
        assert_eq!(name(LayerKind::Attention, PassKind::InputGrad), "unroll_1x4");
    }

    #[test]
    fn test_naive_not_replaceable() {
        let mut reg = KernelRegistry::<f32>::new();
        reg.register(NAIVE, Box::new(Unroll1x4Matmul));
        let s = MatmulShape::new(2, 2, 4);
        let prefs = MatmulPreference::default();
        assert_eq!(reg.select(LayerKind::Linear, PassKind::Forward, &prefs, &s).name(), "naive");
        assert_eq!(reg.ids(), vec![NAIVE, UNROLL_1X4, UNROLL_2X2]);
    }
}
