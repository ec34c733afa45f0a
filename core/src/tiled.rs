/// Double-buffered forward pass for targets with a small fast memory.
///
/// Produces exactly the tensors `forward::forward` produces, bit for bit,
/// while streaming weights and per-head Q/K/V through two alternating
/// fast-memory slots so each transfer overlaps compute on the other slot.
///
///   Phase 1 (projection): tiles of `tile_rows` rows of [W_qᵀ; W_kᵀ; W_vᵀ]
///     are gathered from the E×F weights, multiplied with the staged input,
///     biased and stored to their rows of Q/K/V.
///   Phase 2 (attention): per head, Q_i|K_i|V_i are loaded together, the
///     head is computed into [softmax L×L | attention H×L] and stored.
///
/// Each phase ends with a full barrier; the output projection then runs
/// from slow memory as in the plain forward pass.

use std::mem;
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, debug_span, trace};

use crate::dispatch::{LayerKind, MatmulShape, PassKind};
use crate::dma::{Dma, Strided, Transfer, TransferMode};
use crate::error::{MhsaError, Result};
use crate::forward::{attend_head, project_output, validate};
use crate::kernels::Executor;
use crate::model::{Activations, MhsaConfig, MhsaParams};
use crate::real::Real;
use crate::tensor::Scratch;

/// Tile size and transfer behaviour of the double-buffered pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TilingConfig {
    /// Weight rows per projection tile. Must divide `hidden_dim`.
    pub tile_rows: usize,
    pub transfer: TransferMode,
    /// Reject configurations whose working set exceeds this many bytes.
    pub fast_memory_budget: Option<usize>,
}

impl TilingConfig {
    pub fn new(tile_rows: usize) -> Self {
        TilingConfig {
            tile_rows,
            transfer: TransferMode::Threaded,
            fast_memory_budget: None,
        }
    }

    pub fn inline(mut self) -> Self {
        self.transfer = TransferMode::Inline;
        self
    }

    pub fn with_budget(mut self, bytes: usize) -> Self {
        self.fast_memory_budget = Some(bytes);
        self
    }

    /// Peak fast-memory elements: staged input, the larger phase's slot
    /// pair, and the scratch set. Fails on an invalid `cfg`.
    pub fn fast_memory_elems(&self, cfg: &MhsaConfig) -> Result<usize> {
        cfg.validate()?;
        let (l, e) = (cfg.seq_len, cfg.embed_dim);
        let hl = cfg.head_dim() * l;
        let t = self.tile_rows;
        let projection = 2 * (t * e + t * l);
        let attention = 2 * (3 * hl + l * l + hl);
        let scratch = cfg.temp_len() + l * l + 2 * l;
        Ok(e * l + projection.max(attention) + scratch)
    }

    pub fn fast_memory_bytes<T: Real>(&self, cfg: &MhsaConfig) -> Result<usize> {
        Ok(self.fast_memory_elems(cfg)? * mem::size_of::<T>())
    }

    pub fn validate<T: Real>(&self, cfg: &MhsaConfig) -> Result<()> {
        cfg.validate()?;
        if self.tile_rows == 0 || cfg.hidden_dim % self.tile_rows != 0 {
            return Err(MhsaError::BadTiling {
                tile_rows: self.tile_rows,
                hidden_dim: cfg.hidden_dim,
            });
        }
        if let Some(budget) = self.fast_memory_budget {
            let required = self.fast_memory_bytes::<T>(cfg)?;
            if required > budget {
                return Err(MhsaError::FastMemoryExceeded { required, budget });
            }
        }
        Ok(())
    }
}

// ── Slots ────────────────────────────────────────────────────────────

/// A fast-memory buffer that is either resident or owned by a transfer.
enum Buf<'scope, T> {
    Idle(Vec<T>),
    Busy(Transfer<'scope, T>),
}

impl<'scope, T: Real> Buf<'scope, T> {
    fn take(&mut self) -> Result<Vec<T>> {
        match mem::replace(self, Buf::Idle(Vec::new())) {
            Buf::Idle(v) => Ok(v),
            Buf::Busy(t) => t.wait(),
        }
    }
}

/// One half of the double buffer: an inbound and an outbound buffer.
struct Slot<'scope, T> {
    inbound: Buf<'scope, T>,
    outbound: Buf<'scope, T>,
}

impl<'scope, T: Real> Slot<'scope, T> {
    fn new(in_len: usize, out_len: usize) -> Self {
        Slot {
            inbound: Buf::Idle(vec![T::zero(); in_len]),
            outbound: Buf::Idle(vec![T::zero(); out_len]),
        }
    }

    fn fetch<'env>(&mut self, dma: &Dma<'scope, 'env>, segments: Vec<Strided<'env, T>>) -> Result<()> {
        let buf = self.inbound.take()?;
        self.inbound = Buf::Busy(dma.load(buf, segments));
        Ok(())
    }

    /// Wait for the load into this slot and the store out of it.
    fn acquire(&mut self) -> Result<(Vec<T>, Vec<T>)> {
        let inbound = self.inbound.take()?;
        let outbound = self.outbound.take()?;
        Ok((inbound, outbound))
    }

    fn release<'env>(
        &mut self,
        dma: &Dma<'scope, 'env>,
        inbound: Vec<T>,
        outbound: Vec<T>,
        dsts: Vec<&'env mut [T]>,
    ) {
        self.inbound = Buf::Idle(inbound);
        self.outbound = Buf::Busy(dma.store(outbound, dsts));
    }

    fn drain(mut self) -> Result<()> {
        self.acquire().map(|_| ())
    }
}

// ── Forward ──────────────────────────────────────────────────────────

pub fn forward_double_buffered<T: Real>(
    exec: &Executor<T>,
    cfg: &MhsaConfig,
    tiling: &TilingConfig,
    params: &MhsaParams<T>,
    acts: &mut Activations<T>,
    scratch: &mut Scratch<T>,
) -> Result<()> {
    validate(cfg, params, acts, scratch)?;
    tiling.validate::<T>(cfg)?;
    let _span = debug_span!(
        "mhsa_forward_tiled",
        l = cfg.seq_len,
        e = cfg.embed_dim,
        f = cfg.hidden_dim,
        heads = cfg.num_heads,
        tile_rows = tiling.tile_rows,
        precision = T::NAME,
    )
    .entered();
    let bytes = tiling.fast_memory_bytes::<T>(cfg)?;
    debug!(
        bytes,
        mode = ?tiling.transfer,
        "fast-memory working set"
    );

    let staged_input = Dma::inline()
        .load(vec![T::zero(); acts.input.numel()], vec![Strided::contiguous(&acts.input.data)])
        .wait()?;

    project_tiles(exec, cfg, tiling, params, &staged_input, acts)?;
    attend_heads(exec, cfg, tiling.transfer, acts, scratch)?;

    project_output(exec, cfg, &params.w_out.data, &acts.attention_map.data, &mut acts.output.data);
    Ok(())
}

/// Phase 1: Q/K/V = Wᵀ · input + b, one `tile_rows`-row tile at a time.
fn project_tiles<T: Real>(
    exec: &Executor<T>,
    cfg: &MhsaConfig,
    tiling: &TilingConfig,
    params: &MhsaParams<T>,
    input: &[T],
    acts: &mut Activations<T>,
) -> Result<()> {
    let (l, e, f) = (cfg.seq_len, cfg.embed_dim, cfg.hidden_dim);
    let t = tiling.tile_rows;
    let per_branch = f / t;
    let n_tiles = 3 * per_branch;
    let weights = [&params.w_in_q.data[..], &params.w_in_k.data[..], &params.w_in_v.data[..]];
    let biases = [&params.b_in_q.data[..], &params.b_in_k.data[..], &params.b_in_v.data[..]];

    // Rows row0..row0+t of Wᵀ, i.e. columns of the E×F weight.
    let tile = move |j: usize| {
        let row0 = (j % per_branch) * t;
        vec![Strided::new(weights[j / per_branch], row0, t, e, 1, f)]
    };
    let outputs = acts
        .q
        .data
        .chunks_mut(t * l)
        .chain(acts.k.data.chunks_mut(t * l))
        .chain(acts.v.data.chunks_mut(t * l));
    let mode = tiling.transfer;

    thread::scope(move |s| -> Result<()> {
        let dma = Dma::for_mode(mode, s);
        let mut slots = [Slot::new(t * e, t * l), Slot::new(t * e, t * l)];
        slots[0].fetch(&dma, tile(0))?;

        for (j, dst) in outputs.enumerate() {
            let cur = j % 2;
            let (w_tile, mut out) = slots[cur].acquire()?;
            if j + 1 < n_tiles {
                slots[1 - cur].fetch(&dma, tile(j + 1))?;
            }
            trace!(tile = j, "projection tile");

            let row0 = (j % per_branch) * t;
            exec.matmul(
                LayerKind::Linear,
                PassKind::Forward,
                &w_tile,
                input,
                &mut out,
                MatmulShape::new(t, e, l),
            );
            exec.add_row_bias(&mut out, &biases[j / per_branch][row0..row0 + t], l);
            slots[cur].release(&dma, w_tile, out, vec![dst]);
        }

        let [a, b] = slots;
        a.drain()?;
        b.drain()
    })
}

/// Phase 2: per-head attention with Q_i|K_i|V_i double-buffered.
fn attend_heads<T: Real>(
    exec: &Executor<T>,
    cfg: &MhsaConfig,
    mode: TransferMode,
    acts: &mut Activations<T>,
    scratch: &mut Scratch<T>,
) -> Result<()> {
    let l = cfg.seq_len;
    let (hl, ll) = (cfg.head_dim() * l, l * l);
    let n_heads = cfg.num_heads;
    let scale = exec.attention_scale(cfg.head_dim());
    let (q, k, v) = (&acts.q.data[..], &acts.k.data[..], &acts.v.data[..]);

    let head = move |i: usize| {
        vec![
            Strided::new(q, i * hl, 1, hl, hl, 1),
            Strided::new(k, i * hl, 1, hl, hl, 1),
            Strided::new(v, i * hl, 1, hl, hl, 1),
        ]
    };
    let outputs = acts
        .softmax_buffer
        .data
        .chunks_mut(ll)
        .zip(acts.attention_map.data.chunks_mut(hl));

    thread::scope(move |s| -> Result<()> {
        let dma = Dma::for_mode(mode, s);
        let mut slots = [Slot::new(3 * hl, ll + hl), Slot::new(3 * hl, ll + hl)];
        slots[0].fetch(&dma, head(0))?;

        for (i, (scores_dst, attn_dst)) in outputs.enumerate() {
            let cur = i % 2;
            let (qkv, mut out) = slots[cur].acquire()?;
            if i + 1 < n_heads {
                slots[1 - cur].fetch(&dma, head(i + 1))?;
            }
            trace!(head = i, "attention head (tiled)");

            let (q_i, rest) = qkv.split_at(hl);
            let (k_i, v_i) = rest.split_at(hl);
            let (scores, attn) = out.split_at_mut(ll);
            attend_head(exec, cfg, scale, q_i, k_i, v_i, scores, attn, scratch);
            slots[cur].release(&dma, qkv, out, vec![scores_dst, attn_dst]);
        }

        let [a, b] = slots;
        a.drain()?;
        b.drain()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::forward;
    use crate::model::ExecConfig;

    #[test]
    fn test_tiling_validation() {
        let cfg = MhsaConfig::test_config();
        assert!(TilingConfig::new(4).validate::<f32>(&cfg).is_ok());
        assert_eq!(
            TilingConfig::new(3).validate::<f32>(&cfg),
            Err(MhsaError::BadTiling { tile_rows: 3, hidden_dim: 8 })
        );
        assert!(TilingConfig::new(0).validate::<f32>(&cfg).is_err());
    }

    #[test]
    fn test_budget_scales_with_precision() {
        let cfg = MhsaConfig::test_config();
        let tiling = TilingConfig::new(2);
        assert_eq!(
            tiling.fast_memory_bytes::<f32>(&cfg).unwrap(),
            2 * tiling.fast_memory_bytes::<half::f16>(&cfg).unwrap()
        );
        let bytes = tiling.fast_memory_bytes::<f32>(&cfg).unwrap();
        assert!(tiling.with_budget(bytes).validate::<f32>(&cfg).is_ok());
        assert_eq!(
            tiling.with_budget(bytes - 1).validate::<f32>(&cfg),
            Err(MhsaError::FastMemoryExceeded { required: bytes, budget: bytes - 1 })
        );
    }

    #[test]
    fn test_footprint_rejects_invalid_config() {
        let tiling = TilingConfig::new(2);
        assert_eq!(
            tiling.fast_memory_elems(&MhsaConfig::new(4, 6, 8, 0)),
            Err(MhsaError::ZeroDimension("num_heads"))
        );
        assert!(tiling.fast_memory_bytes::<f32>(&MhsaConfig::new(4, 6, 8, 3)).is_err());
        assert!(tiling.validate::<f32>(&MhsaConfig::new(4, 6, 8, 0)).is_err());
    }

    #[test]
    fn test_single_tile_single_head_matches() {
        let cfg = MhsaConfig::new(3, 4, 2, 1);
        let exec = Executor::<f32>::new(ExecConfig::default()).unwrap();
        let params = MhsaParams::init(&cfg, 11);
        let mut plain = Activations::random_input(&cfg, 12);
        let mut tiled = plain.clone();
        let mut scratch = Scratch::for_config(&cfg);
        forward(&exec, &cfg, &params, &mut plain, &mut scratch).unwrap();
        forward_double_buffered(&exec, &cfg, &TilingConfig::new(2), &params, &mut tiled, &mut scratch)
            .unwrap();
        assert_eq!(plain.output.data, tiled.output.data);
        assert_eq!(plain.softmax_buffer.data, tiled.softmax_buffer.data);
    }
}
