/// MHSA backward pass.
///
/// Consumes the tensors persisted by `forward` plus `output.diff`, then
/// writes every parameter gradient and the intermediate diffs of
/// `attention_map`, `softmax_buffer`, `q`, `k` and `v`.
///
/// `input.diff` is ACCUMULATED, not overwritten. The caller zeroes it
/// (`Activations::zero_input_grad`) unless it is adding onto a gradient that
/// is already there. Every other diff is fully overwritten.
///
/// Gradients of the input projections are stored in the weights' own E×F
/// layout: dW = input · dQᵀ, the transpose of the gradient w.r.t. the
/// effective projection Wᵀ.

use tracing::{debug_span, trace};

use crate::dispatch::{LayerKind, MatmulShape, PassKind};
use crate::error::Result;
use crate::kernels::Executor;
use crate::model::{Activations, MhsaConfig, MhsaParams};
use crate::real::Real;
use crate::tensor::{HeadView, Scratch, Tensor};

pub fn backward<T: Real>(
    exec: &Executor<T>,
    cfg: &MhsaConfig,
    params: &mut MhsaParams<T>,
    acts: &mut Activations<T>,
    scratch: &mut Scratch<T>,
) -> Result<()> {
    cfg.validate()?;
    params.validate(cfg, true)?;
    acts.validate(cfg, true)?;
    scratch.validate(cfg)?;
    let _span = debug_span!(
        "mhsa_backward",
        l = cfg.seq_len,
        e = cfg.embed_dim,
        f = cfg.hidden_dim,
        heads = cfg.num_heads,
        precision = T::NAME,
    )
    .entered();

    output_projection_backward(exec, cfg, params, acts, scratch)?;

    let heads = cfg.head_view()?;
    let scores = cfg.score_view()?;
    let scale = exec.attention_scale(cfg.head_dim());
    for i in 0..cfg.num_heads {
        trace!(head = i, "attention head backward");
        head_backward(exec, cfg, &heads, &scores, scale, i, acts, scratch)?;
    }

    input_projection_backward(exec, cfg, params, acts, scratch)
}

/// `w_out.diff = output.diff · attention_mapᵀ`,
/// `attention_map.diff = w_outᵀ · output.diff`.
fn output_projection_backward<T: Real>(
    exec: &Executor<T>,
    cfg: &MhsaConfig,
    params: &mut MhsaParams<T>,
    acts: &mut Activations<T>,
    scratch: &mut Scratch<T>,
) -> Result<()> {
    let (l, e, f) = (cfg.seq_len, cfg.embed_dim, cfg.hidden_dim);
    let temp = &mut scratch.temp;
    let out_diff = acts.output.diff_of("output")?;

    exec.transpose(&acts.attention_map.data, &mut temp[..f * l], f, l);
    let (_, w_out_diff) = params.w_out.split_mut("w_out")?;
    exec.matmul(
        LayerKind::Linear,
        PassKind::WeightGrad,
        out_diff,
        &temp[..l * f],
        w_out_diff,
        MatmulShape::new(e, l, f),
    );

    exec.transpose(&params.w_out.data, &mut temp[..e * f], e, f);
    let (_, attn_diff) = acts.attention_map.split_mut("attention_map")?;
    exec.matmul(
        LayerKind::Linear,
        PassKind::InputGrad,
        &temp[..f * e],
        out_diff,
        attn_diff,
        MatmulShape::new(f, e, l),
    );
    Ok(())
}

/// Gradients through softmax and the score/value products of head `i`.
#[allow(clippy::too_many_arguments)]
fn head_backward<T: Real>(
    exec: &Executor<T>,
    cfg: &MhsaConfig,
    heads: &HeadView,
    scores: &HeadView,
    scale: T,
    i: usize,
    acts: &mut Activations<T>,
    scratch: &mut Scratch<T>,
) -> Result<()> {
    let (l, h) = (cfg.seq_len, cfg.head_dim());
    let attn_diff = heads.head(acts.attention_map.diff_of("attention_map")?, i);
    let (p_all, dp_all) = acts.softmax_buffer.split_mut("softmax_buffer")?;
    let (p, dp) = (scores.head(p_all, i), scores.head_mut(dp_all, i));
    let (q_all, dq_all) = acts.q.split_mut("q")?;
    let (k_all, dk_all) = acts.k.split_mut("k")?;
    let (v_all, dv_all) = acts.v.split_mut("v")?;
    let (q, dq) = (heads.head(q_all, i), heads.head_mut(dq_all, i));
    let (k, dk) = (heads.head(k_all, i), heads.head_mut(dk_all, i));
    let (v, dv) = (heads.head(v_all, i), heads.head_mut(dv_all, i));
    let temp = &mut scratch.temp;
    let grad = &mut scratch.grad[..l * l];

    // A = V · Pᵀ  ⇒  dV = dA · P,  d(Pᵀ) = Vᵀ · dA
    exec.matmul(LayerKind::Attention, PassKind::WeightGrad, attn_diff, p, dv, MatmulShape::new(h, l, l));
    exec.transpose(v, &mut temp[..l * h], h, l);
    exec.matmul(
        LayerKind::Attention,
        PassKind::InputGrad,
        &temp[..l * h],
        attn_diff,
        dp,
        MatmulShape::new(l, h, l),
    );

    // dP back to query-major rows, through the softmax, then key-major again.
    exec.transpose_in_place(dp, temp, l, l);
    exec.softmax_rows_grad(p, dp, grad, &mut scratch.sums, l, l);
    exec.transpose_in_place(grad, temp, l, l);
    exec.scale(grad, scale);

    // S = Kᵀ · Q  ⇒  d(Kᵀ) = dS · Qᵀ,  dQ = K · dS
    exec.transpose(q, &mut temp[..l * h], h, l);
    exec.matmul(
        LayerKind::Attention,
        PassKind::WeightGrad,
        grad,
        &temp[..l * h],
        dk,
        MatmulShape::new(l, l, h),
    );
    exec.transpose_in_place(dk, temp, l, h);
    exec.matmul(LayerKind::Attention, PassKind::InputGrad, k, grad, dq, MatmulShape::new(h, l, l));
    Ok(())
}

/// Input-projection gradients for all three branches, from the persisted
/// `q/k/v.diff`. Writes `w_in_*.diff` and `b_in_*.diff`, adds each branch's
/// `W · d(branch)` into `input.diff`.
pub fn input_projection_backward<T: Real>(
    exec: &Executor<T>,
    cfg: &MhsaConfig,
    params: &mut MhsaParams<T>,
    acts: &mut Activations<T>,
    scratch: &mut Scratch<T>,
) -> Result<()> {
    let temp = &mut scratch.temp;
    let branches = [
        (&mut params.w_in_q, &mut params.b_in_q, &acts.q, "q"),
        (&mut params.w_in_k, &mut params.b_in_k, &acts.k, "k"),
        (&mut params.w_in_v, &mut params.b_in_v, &acts.v, "v"),
    ];
    for (w, b, branch, name) in branches {
        trace!(branch = name, "input projection backward");
        branch_backward(exec, cfg, w, b, branch.diff_of(name)?, &mut acts.input, temp)?;
    }
    Ok(())
}

fn branch_backward<T: Real>(
    exec: &Executor<T>,
    cfg: &MhsaConfig,
    w: &mut Tensor<T>,
    b: &mut Tensor<T>,
    branch_diff: &[T],
    input: &mut Tensor<T>,
    temp: &mut [T],
) -> Result<()> {
    let (l, e, f) = (cfg.seq_len, cfg.embed_dim, cfg.hidden_dim);

    let (w_data, w_diff) = w.split_mut("w_in")?;
    exec.matmul(
        LayerKind::Linear,
        PassKind::WeightGrad,
        &input.data,
        branch_diff,
        w_diff,
        MatmulShape::transposed_b(e, l, f),
    );
    exec.row_sums(branch_diff, b.split_mut("b_in")?.1, l);

    let staged = &mut temp[..e * l];
    exec.matmul(LayerKind::Linear, PassKind::InputGrad, w_data, branch_diff, staged, MatmulShape::new(e, f, l));
    let (_, input_diff) = input.split_mut("input")?;
    exec.add_assign(input_diff, staged);
    Ok(())
}
