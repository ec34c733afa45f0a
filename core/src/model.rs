/// MHSA layer configuration, parameters and working tensors.
///
/// Layout (row-major, L = seq_len, E = embed_dim, F = hidden_dim):
///   w_in_q/k/v: [E, F]  used transposed (effective projection is Wᵀ, [F, E])
///   b_in_q/k/v: [F, 1]
///   w_out:      [E, F]  pre-transposed: output = w_out · attention_map
///   input, output:             [E, L]
///   q, k, v, attention_map:    [F, L]
///   softmax_buffer:            [num_heads * L, L]

use serde::{Deserialize, Serialize};

use crate::dispatch::MatmulPreference;
use crate::error::{MhsaError, Result};
use crate::real::{fast_inv_sqrt, Real};
use crate::tensor::{HeadView, SimpleRng, Tensor};

/// Layer dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MhsaConfig {
    pub seq_len: usize,
    pub embed_dim: usize,
    pub hidden_dim: usize,
    pub num_heads: usize,
}

impl MhsaConfig {
    pub fn new(seq_len: usize, embed_dim: usize, hidden_dim: usize, num_heads: usize) -> Self {
        MhsaConfig {
            seq_len,
            embed_dim,
            hidden_dim,
            num_heads,
        }
    }

    /// Small config for unit tests: L=4, E=6, F=8, 2 heads.
    pub fn test_config() -> Self {
        MhsaConfig::new(4, 6, 8, 2)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("seq_len", self.seq_len),
            ("embed_dim", self.embed_dim),
            ("hidden_dim", self.hidden_dim),
            ("num_heads", self.num_heads),
        ] {
            if v == 0 {
                return Err(MhsaError::ZeroDimension(name));
            }
        }
        if self.hidden_dim % self.num_heads != 0 {
            return Err(MhsaError::HeadsDoNotDivide {
                hidden_dim: self.hidden_dim,
                num_heads: self.num_heads,
            });
        }
        Ok(())
    }

    /// H = F / num_heads.
    pub fn head_dim(&self) -> usize {
        self.hidden_dim / self.num_heads
    }

    /// Minimum `Scratch::temp` length: every transpose/matmul staged through it.
    pub fn temp_len(&self) -> usize {
        let (l, e, f) = (self.seq_len, self.embed_dim, self.hidden_dim);
        (f * e).max(f * l).max(l * l).max(e * l)
    }

    /// View of Q/K/V/attention_map as per-head `H×L` blocks.
    pub fn head_view(&self) -> Result<HeadView> {
        HeadView::new(
            self.hidden_dim * self.seq_len,
            self.num_heads,
            self.head_dim() * self.seq_len,
        )
    }

    /// View of the softmax buffer as per-head `L×L` blocks.
    pub fn score_view(&self) -> Result<HeadView> {
        HeadView::new(
            self.num_heads * self.seq_len * self.seq_len,
            self.num_heads,
            self.seq_len * self.seq_len,
        )
    }
}

/// How the attention scale `1/sqrt(H)` is computed. Forward and backward
/// always share the same factor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleMode {
    #[default]
    Exact,
    /// Bit-trick reciprocal square root with one Newton step.
    FastInverseSqrt,
}

impl ScaleMode {
    pub fn factor<T: Real>(self, head_dim: usize) -> T {
        match self {
            ScaleMode::Exact => T::one() / T::cast(head_dim as f64).sqrt(),
            ScaleMode::FastInverseSqrt => T::cast(fast_inv_sqrt(head_dim as f32) as f64),
        }
    }
}

/// Execution settings for an `Executor`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Fixed worker count for every fork-join dispatch.
    pub workers: usize,
    pub scaling: ScaleMode,
    /// Matmul strategy per `(LayerKind, PassKind)`.
    pub matmul: MatmulPreference,
}

impl Default for ExecConfig {
    fn default() -> Self {
        ExecConfig {
            workers: 1,
            scaling: ScaleMode::Exact,
            matmul: MatmulPreference::default(),
        }
    }
}

impl ExecConfig {
    pub fn with_workers(workers: usize) -> Self {
        ExecConfig {
            workers,
            ..Self::default()
        }
    }
}

/// Learnable parameters. Every tensor carries a gradient buffer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MhsaParams<T> {
    pub w_in_q: Tensor<T>,
    pub w_in_k: Tensor<T>,
    pub w_in_v: Tensor<T>,
    pub b_in_q: Tensor<T>,
    pub b_in_k: Tensor<T>,
    pub b_in_v: Tensor<T>,
    pub w_out: Tensor<T>,
}

impl<T: Real> MhsaParams<T> {
    pub fn init(cfg: &MhsaConfig, seed: u64) -> Self {
        let mut rng = SimpleRng::new(seed);
        let (e, f) = (cfg.embed_dim, cfg.hidden_dim);
        let proj_scale = (2.0 / (e + f) as f64).sqrt(); // Xavier for E↔F
        let bias_scale = 0.1;

        let mut p = Self::zeros_like(cfg);
        rng.fill_uniform(&mut p.w_in_q.data, proj_scale);
        rng.fill_uniform(&mut p.w_in_k.data, proj_scale);
        rng.fill_uniform(&mut p.w_in_v.data, proj_scale);
        rng.fill_uniform(&mut p.b_in_q.data, bias_scale);
        rng.fill_uniform(&mut p.b_in_k.data, bias_scale);
        rng.fill_uniform(&mut p.b_in_v.data, bias_scale);
        rng.fill_uniform(&mut p.w_out.data, proj_scale);
        p
    }

    pub fn zeros_like(cfg: &MhsaConfig) -> Self {
        let (e, f) = (cfg.embed_dim, cfg.hidden_dim);
        MhsaParams {
            w_in_q: Tensor::trainable(e, f),
            w_in_k: Tensor::trainable(e, f),
            w_in_v: Tensor::trainable(e, f),
            b_in_q: Tensor::trainable(f, 1),
            b_in_k: Tensor::trainable(f, 1),
            b_in_v: Tensor::trainable(f, 1),
            w_out: Tensor::trainable(e, f),
        }
    }

    /// Total number of parameters.
    pub fn num_params(&self) -> usize {
        self.tensors().iter().map(|t| t.numel()).sum()
    }

    pub fn zero_grad(&mut self) {
        for t in self.tensors_mut() {
            t.zero_grad();
        }
    }

    fn tensors(&self) -> [&Tensor<T>; 7] {
        [
            &self.w_in_q,
            &self.w_in_k,
            &self.w_in_v,
            &self.b_in_q,
            &self.b_in_k,
            &self.b_in_v,
            &self.w_out,
        ]
    }

    fn tensors_mut(&mut self) -> [&mut Tensor<T>; 7] {
        [
            &mut self.w_in_q,
            &mut self.w_in_k,
            &mut self.w_in_v,
            &mut self.b_in_q,
            &mut self.b_in_k,
            &mut self.b_in_v,
            &mut self.w_out,
        ]
    }

    pub(crate) fn validate(&self, cfg: &MhsaConfig, need_grad: bool) -> Result<()> {
        let (e, f) = (cfg.embed_dim, cfg.hidden_dim);
        self.w_in_q.ensure("w_in_q", e, f, need_grad)?;
        self.w_in_k.ensure("w_in_k", e, f, need_grad)?;
        self.w_in_v.ensure("w_in_v", e, f, need_grad)?;
        self.b_in_q.ensure("b_in_q", f, 1, need_grad)?;
        self.b_in_k.ensure("b_in_k", f, 1, need_grad)?;
        self.b_in_v.ensure("b_in_v", f, 1, need_grad)?;
        self.w_out.ensure("w_out", e, f, need_grad)
    }
}

/// Working tensors retained from forward to backward.
#[derive(Clone, Debug, PartialEq)]
pub struct Activations<T> {
    pub input: Tensor<T>,
    pub output: Tensor<T>,
    pub q: Tensor<T>,
    pub k: Tensor<T>,
    pub v: Tensor<T>,
    pub attention_map: Tensor<T>,
    pub softmax_buffer: Tensor<T>,
}

impl<T: Real> Activations<T> {
    /// Allocate every working tensor, all with gradient buffers.
    pub fn new(cfg: &MhsaConfig) -> Self {
        let (l, e, f) = (cfg.seq_len, cfg.embed_dim, cfg.hidden_dim);
        Activations {
            input: Tensor::trainable(e, l),
            output: Tensor::trainable(e, l),
            q: Tensor::trainable(f, l),
            k: Tensor::trainable(f, l),
            v: Tensor::trainable(f, l),
            attention_map: Tensor::trainable(f, l),
            softmax_buffer: Tensor::trainable(cfg.num_heads * l, l),
        }
    }

    /// Allocate and fill `input` uniformly in [-1, 1].
    pub fn random_input(cfg: &MhsaConfig, seed: u64) -> Self {
        let mut acts = Self::new(cfg);
        SimpleRng::new(seed).fill_uniform(&mut acts.input.data, 1.0);
        acts
    }

    /// Backward accumulates into `input.diff`; call this first unless the
    /// caller wants to add onto an existing gradient.
    pub fn zero_input_grad(&mut self) {
        self.input.zero_grad();
    }

    pub(crate) fn validate(&self, cfg: &MhsaConfig, need_grad: bool) -> Result<()> {
        let (l, e, f) = (cfg.seq_len, cfg.embed_dim, cfg.hidden_dim);
        self.input.ensure("input", e, l, need_grad)?;
        self.output.ensure("output", e, l, need_grad)?;
        self.q.ensure("q", f, l, need_grad)?;
        self.k.ensure("k", f, l, need_grad)?;
        self.v.ensure("v", f, l, need_grad)?;
        self.attention_map.ensure("attention_map", f, l, need_grad)?;
        self.softmax_buffer
            .ensure("softmax_buffer", cfg.num_heads * l, l, need_grad)
    }
}

/// Internal wrapper for JSON checkpoint format.
#[derive(Serialize, Deserialize)]
struct ParamCheckpoint<T> {
    config: MhsaConfig,
    params: MhsaParams<T>,
}

/// Save parameters + config to a JSON file.
pub fn save_checkpoint<T: Real + Serialize>(
    path: &std::path::Path,
    params: &MhsaParams<T>,
    config: &MhsaConfig,
) -> std::io::Result<()> {
    let checkpoint = ParamCheckpoint {
        config: *config,
        params: params.clone(),
    };
    let json = serde_json::to_string(&checkpoint)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, json)
}

/// Load parameters + config from a JSON file.
pub fn load_checkpoint<T: Real + serde::de::DeserializeOwned>(
    path: &std::path::Path,
) -> std::io::Result<(MhsaParams<T>, MhsaConfig)> {
    let json = std::fs::read_to_string(path)?;
    let checkpoint: ParamCheckpoint<T> = serde_json::from_str(&json)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    checkpoint
        .config
        .validate()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    checkpoint
        .params
        .validate(&checkpoint.config, false)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok((checkpoint.params, checkpoint.config))
}
