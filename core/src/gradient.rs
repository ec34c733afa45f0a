/// Gradient orchestration and verification.
///
/// Provides:
/// - `compute_gradients`: forward + backward for the scalar loss `Σ output`
/// - `fd_single`: central finite difference for one element
/// - `check_gradient`: sampled analytical-vs-numerical comparison

use crate::backward::backward;
use crate::error::Result;
use crate::forward::forward;
use crate::kernels::Executor;
use crate::model::{Activations, MhsaConfig, MhsaParams};
use crate::real::{sum, Real};
use crate::tensor::{Scratch, Tensor};

/// Run forward, seed `output.diff` with ones (loss = Σ output), zero
/// `input.diff` and run backward. Returns the loss.
pub fn compute_gradients<T: Real>(
    exec: &Executor<T>,
    cfg: &MhsaConfig,
    params: &mut MhsaParams<T>,
    acts: &mut Activations<T>,
    scratch: &mut Scratch<T>,
) -> Result<T> {
    forward(exec, cfg, params, acts, scratch)?;
    let loss = sum(&acts.output.data);
    acts.output.diff = Some(vec![T::one(); acts.output.numel()]);
    acts.zero_input_grad();
    backward(exec, cfg, params, acts, scratch)?;
    Ok(loss)
}

/// Tensors that receive a gradient the caller can use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trainable {
    WInQ,
    WInK,
    WInV,
    BInQ,
    BInK,
    BInV,
    WOut,
    Input,
}

impl Trainable {
    pub const ALL: [Trainable; 8] = [
        Trainable::WInQ,
        Trainable::WInK,
        Trainable::WInV,
        Trainable::BInQ,
        Trainable::BInK,
        Trainable::BInV,
        Trainable::WOut,
        Trainable::Input,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Trainable::WInQ => "w_in_q",
            Trainable::WInK => "w_in_k",
            Trainable::WInV => "w_in_v",
            Trainable::BInQ => "b_in_q",
            Trainable::BInK => "b_in_k",
            Trainable::BInV => "b_in_v",
            Trainable::WOut => "w_out",
            Trainable::Input => "input",
        }
    }

    pub fn tensor<'a, T>(self, params: &'a MhsaParams<T>, acts: &'a Activations<T>) -> &'a Tensor<T> {
        match self {
            Trainable::WInQ => &params.w_in_q,
            Trainable::WInK => &params.w_in_k,
            Trainable::WInV => &params.w_in_v,
            Trainable::BInQ => &params.b_in_q,
            Trainable::BInK => &params.b_in_k,
            Trainable::BInV => &params.b_in_v,
            Trainable::WOut => &params.w_out,
            Trainable::Input => &acts.input,
        }
    }

    pub fn tensor_mut<'a, T>(
        self,
        params: &'a mut MhsaParams<T>,
        acts: &'a mut Activations<T>,
    ) -> &'a mut Tensor<T> {
        match self {
            Trainable::WInQ => &mut params.w_in_q,
            Trainable::WInK => &mut params.w_in_k,
            Trainable::WInV => &mut params.w_in_v,
            Trainable::BInQ => &mut params.b_in_q,
            Trainable::BInK => &mut params.b_in_k,
            Trainable::BInV => &mut params.b_in_v,
            Trainable::WOut => &mut params.w_out,
            Trainable::Input => &mut acts.input,
        }
    }
}

/// Step size and pass criteria for a finite-difference check.
#[derive(Clone, Copy, Debug)]
pub struct FdSettings {
    pub eps: f64,
    /// Max relative error for a pass.
    pub tol: f64,
    /// Both gradients below this auto-pass (under FD resolution).
    pub abs_threshold: f64,
}

impl FdSettings {
    pub fn for_f64() -> Self {
        FdSettings {
            eps: 1e-6,
            tol: 1e-4,
            abs_threshold: 1e-5,
        }
    }

    pub fn for_f32() -> Self {
        FdSettings {
            eps: 1e-2,
            tol: 0.10,
            abs_threshold: 5e-4,
        }
    }
}

/// Result of one `check_gradient` sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct GradCheck {
    pub checked: usize,
    pub passed: usize,
    pub max_rel_err: f64,
}

impl GradCheck {
    pub fn all_passed(&self) -> bool {
        self.checked > 0 && self.checked == self.passed
    }
}

fn loss_at<T: Real>(
    exec: &Executor<T>,
    cfg: &MhsaConfig,
    params: &MhsaParams<T>,
    acts: &mut Activations<T>,
    scratch: &mut Scratch<T>,
) -> Result<f64> {
    forward(exec, cfg, params, acts, scratch)?;
    Ok(acts.output.data.iter().map(|v| v.wide()).sum())
}

/// Central difference `(L(x+eps) - L(x-eps)) / 2eps` for element `idx` of `which`.
pub fn fd_single<T: Real>(
    exec: &Executor<T>,
    cfg: &MhsaConfig,
    params: &MhsaParams<T>,
    acts: &Activations<T>,
    which: Trainable,
    idx: usize,
    eps: f64,
) -> Result<f64> {
    let mut scratch = Scratch::for_config(cfg);
    let orig = which.tensor(params, acts).data[idx].wide();

    let (mut p_plus, mut a_plus) = (params.clone(), acts.clone());
    which.tensor_mut(&mut p_plus, &mut a_plus).data[idx] = T::cast(orig + eps);
    let loss_plus = loss_at(exec, cfg, &p_plus, &mut a_plus, &mut scratch)?;

    let (mut p_minus, mut a_minus) = (params.clone(), acts.clone());
    which.tensor_mut(&mut p_minus, &mut a_minus).data[idx] = T::cast(orig - eps);
    let loss_minus = loss_at(exec, cfg, &p_minus, &mut a_minus, &mut scratch)?;

    Ok((loss_plus - loss_minus) / (2.0 * eps))
}

/// Compare the gradient stored in `which`'s diff against finite differences
/// on up to `num_samples` evenly strided elements.
///
/// `params`/`acts` must come from `compute_gradients`. Relative error uses
/// denominator max(|a|, |n|); pairs under `abs_threshold` auto-pass.
pub fn check_gradient<T: Real>(
    exec: &Executor<T>,
    cfg: &MhsaConfig,
    params: &MhsaParams<T>,
    acts: &Activations<T>,
    which: Trainable,
    num_samples: usize,
    fd: FdSettings,
) -> Result<GradCheck> {
    let tensor = which.tensor(params, acts);
    let grad = tensor.diff_of(which.name())?;
    let n = tensor.numel();
    let step = if n > num_samples { n / num_samples } else { 1 };
    let name = which.name();
    let mut report = GradCheck::default();

    for idx in (0..n).step_by(step).take(num_samples) {
        let analytical = grad[idx].wide();
        let numerical = fd_single(exec, cfg, params, acts, which, idx, fd.eps)?;

        let abs_diff = (analytical - numerical).abs();
        let denom = analytical.abs().max(numerical.abs());
        report.checked += 1;

        if denom < fd.abs_threshold {
            report.passed += 1;
            continue;
        }

        let rel_err = abs_diff / denom;
        report.max_rel_err = report.max_rel_err.max(rel_err);
        if rel_err < fd.tol {
            report.passed += 1;
        } else {
            eprintln!(
                "  FAIL {name}[{idx}]: analytical={analytical:.6e}, numerical={numerical:.6e}, \
                 rel_err={rel_err:.4e}"
            );
        }
    }

    Ok(report)
}
