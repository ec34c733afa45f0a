/// MHSA forward pass.
///
/// Pipeline per call:
///   1. Q/K/V = W_inᵀ · input + b_in            (one transpose + matmul per branch)
///   2. per head: S = K_iᵀ · Q_i, scaled         (L×L, key-major)
///   3. per head: P = softmax over rows of Sᵀ     (query-major, persisted)
///   4. per head: A_i = V_i · Pᵀ                  (H×L)
///   5. output = w_out · A
///
/// Every transpose lands in `scratch.temp` and is consumed by the next op.

use tracing::{debug_span, trace};

use crate::dispatch::{LayerKind, MatmulShape, PassKind};
use crate::error::Result;
use crate::kernels::Executor;
use crate::model::{Activations, MhsaConfig, MhsaParams};
use crate::real::Real;
use crate::tensor::{Scratch, Tensor};

/// Run the forward pass, writing `acts.output` and the persisted
/// `q`, `k`, `v`, `attention_map` and `softmax_buffer`.
pub fn forward<T: Real>(
    exec: &Executor<T>,
    cfg: &MhsaConfig,
    params: &MhsaParams<T>,
    acts: &mut Activations<T>,
    scratch: &mut Scratch<T>,
) -> Result<()> {
    validate(cfg, params, acts, scratch)?;
    let _span = debug_span!(
        "mhsa_forward",
        l = cfg.seq_len,
        e = cfg.embed_dim,
        f = cfg.hidden_dim,
        heads = cfg.num_heads,
        precision = T::NAME,
    )
    .entered();

    let input = &acts.input.data;
    project(exec, cfg, &params.w_in_q, &params.b_in_q, input, &mut acts.q.data, &mut scratch.temp);
    project(exec, cfg, &params.w_in_k, &params.b_in_k, input, &mut acts.k.data, &mut scratch.temp);
    project(exec, cfg, &params.w_in_v, &params.b_in_v, input, &mut acts.v.data, &mut scratch.temp);

    let heads = cfg.head_view()?;
    let scores = cfg.score_view()?;
    let scale = exec.attention_scale(cfg.head_dim());
    for i in 0..cfg.num_heads {
        trace!(head = i, "attention head");
        attend_head(
            exec,
            cfg,
            scale,
            heads.head(&acts.q.data, i),
            heads.head(&acts.k.data, i),
            heads.head(&acts.v.data, i),
            scores.head_mut(&mut acts.softmax_buffer.data, i),
            heads.head_mut(&mut acts.attention_map.data, i),
            scratch,
        );
    }

    project_output(exec, cfg, &params.w_out.data, &acts.attention_map.data, &mut acts.output.data);
    Ok(())
}

pub(crate) fn validate<T: Real>(
    cfg: &MhsaConfig,
    params: &MhsaParams<T>,
    acts: &Activations<T>,
    scratch: &Scratch<T>,
) -> Result<()> {
    cfg.validate()?;
    params.validate(cfg, false)?;
    acts.validate(cfg, false)?;
    scratch.validate(cfg)
}

/// `out (F×L) = wᵀ · input + b`, staging `wᵀ` in `temp`.
fn project<T: Real>(
    exec: &Executor<T>,
    cfg: &MhsaConfig,
    w: &Tensor<T>,
    b: &Tensor<T>,
    input: &[T],
    out: &mut [T],
    temp: &mut [T],
) {
    let (l, e, f) = (cfg.seq_len, cfg.embed_dim, cfg.hidden_dim);
    let wt = &mut temp[..f * e];
    exec.transpose(&w.data, wt, e, f);
    exec.matmul(LayerKind::Linear, PassKind::Forward, wt, input, out, MatmulShape::new(f, e, l));
    exec.add_row_bias(out, &b.data, l);
}

/// Scaled dot-product attention for one head.
///
/// `scores` (L×L) ends up holding the query-major probabilities; `attn`
/// (H×L) receives `v · scoresᵀ`. Shared with the tiled variant, which
/// passes fast-memory slices.
#[allow(clippy::too_many_arguments)]
pub(crate) fn attend_head<T: Real>(
    exec: &Executor<T>,
    cfg: &MhsaConfig,
    scale: T,
    q: &[T],
    k: &[T],
    v: &[T],
    scores: &mut [T],
    attn: &mut [T],
    scratch: &mut Scratch<T>,
) {
    let (l, h) = (cfg.seq_len, cfg.head_dim());
    let temp = &mut scratch.temp;

    exec.transpose(k, &mut temp[..l * h], h, l);
    exec.matmul(
        LayerKind::Attention,
        PassKind::Forward,
        &temp[..l * h],
        q,
        scores,
        MatmulShape::new(l, h, l),
    );
    exec.scale(scores, scale);

    exec.transpose(scores, &mut temp[..l * l], l, l);
    exec.softmax_rows(&temp[..l * l], scores, &mut scratch.maxes, &mut scratch.sums, l, l);

    exec.transpose(scores, &mut temp[..l * l], l, l);
    exec.matmul(
        LayerKind::Attention,
        PassKind::Forward,
        v,
        &temp[..l * l],
        attn,
        MatmulShape::new(h, l, l),
    );
}

/// `output (E×L) = w_out (E×F) · attention_map (F×L)`.
pub(crate) fn project_output<T: Real>(
    exec: &Executor<T>,
    cfg: &MhsaConfig,
    w_out: &[T],
    attention_map: &[T],
    output: &mut [T],
) {
    let (l, e, f) = (cfg.seq_len, cfg.embed_dim, cfg.hidden_dim);
    exec.matmul(
        LayerKind::Linear,
        PassKind::Forward,
        w_out,
        attention_map,
        output,
        MatmulShape::new(e, f, l),
    );
}
