/// Dispatch tests: matmul strategy registry, per-layer/per-pass selection,
/// fallback, and strategy invariance of full forward/backward passes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mhsa_core::dispatch::{
    KernelRegistry, LayerKind, MatmulAlgo, MatmulKernel, MatmulPreference, MatmulShape, NaiveMatmul,
    PassKind, NAIVE, UNROLL_1X4, UNROLL_2X2,
};
use mhsa_core::gradient::compute_gradients;
use mhsa_core::model::ExecConfig;
use mhsa_core::{forward, Activations, Executor, MhsaConfig, MhsaParams, Scratch};

/// Delegates to the naive kernel and counts calls; rejects skinny outputs.
struct Counting {
    calls: Arc<AtomicUsize>,
}

impl MatmulKernel<f32> for Counting {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn supports(&self, shape: &MatmulShape) -> bool {
        shape.m > 1
    }

    fn compute_rows(&self, a: &[f32], b: &[f32], out: &mut [f32], shape: &MatmulShape, first: usize) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        NaiveMatmul.compute_rows(a, b, out, shape, first);
    }
}

fn prefer(algo: MatmulAlgo, workers: usize) -> ExecConfig {
    ExecConfig {
        workers,
        matmul: MatmulPreference::uniform(algo),
        ..ExecConfig::default()
    }
}

// ══════════════════════════════════════════════════════════════════════
// Registry
// ══════════════════════════════════════════════════════════════════════

#[test]
fn test_builtin_ids() {
    let reg = KernelRegistry::<f32>::new();
    assert_eq!(reg.ids(), vec![NAIVE, UNROLL_1X4, UNROLL_2X2]);
}

#[test]
fn test_select_prefers_supported_kernel() {
    let reg = KernelRegistry::<f32>::new();
    let shape = MatmulShape::new(4, 4, 4);
    for (algo, name) in [(NAIVE, "naive"), (UNROLL_1X4, "unroll_1x4"), (UNROLL_2X2, "unroll_2x2")] {
        let prefs = MatmulPreference::uniform(algo);
        assert_eq!(reg.select(LayerKind::Linear, PassKind::Forward, &prefs, &shape).name(), name);
    }
}

#[test]
fn test_select_falls_back_on_shape() {
    let reg = KernelRegistry::<f32>::new();
    let odd = MatmulShape::new(3, 4, 3);
    for algo in [UNROLL_2X2, UNROLL_1X4] {
        let prefs = MatmulPreference::uniform(algo);
        assert_eq!(reg.select(LayerKind::Attention, PassKind::InputGrad, &prefs, &odd).name(), "naive");
    }
}

#[test]
fn test_layer_kinds_select_different_kernels() {
    let (linear, attention) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
    let mut reg = KernelRegistry::<f32>::new();
    reg.register(MatmulAlgo(7), Box::new(Counting { calls: Arc::clone(&linear) }));
    reg.register(MatmulAlgo(8), Box::new(Counting { calls: Arc::clone(&attention) }));
    let exec_cfg = ExecConfig {
        matmul: MatmulPreference::default()
            .with_layer(LayerKind::Linear, MatmulAlgo(7))
            .with_layer(LayerKind::Attention, MatmulAlgo(8)),
        ..ExecConfig::default()
    };

    let cfg = MhsaConfig::test_config();
    let params = MhsaParams::init(&cfg, 1);
    let exec = Executor::with_registry(exec_cfg, reg).unwrap();
    let mut acts = Activations::random_input(&cfg, 2);
    let mut scratch = Scratch::for_config(&cfg);
    forward(&exec, &cfg, &params, &mut acts, &mut scratch).unwrap();
    // 3 input projections + output projection vs 2 products per head.
    assert_eq!(linear.load(Ordering::Relaxed), 4);
    assert_eq!(attention.load(Ordering::Relaxed), 2 * cfg.num_heads);
}

#[test]
fn test_passes_select_different_kernels() {
    let counters: Vec<_> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
    let mut reg = KernelRegistry::<f32>::new();
    for (i, c) in counters.iter().enumerate() {
        reg.register(MatmulAlgo(10 + i as u16), Box::new(Counting { calls: Arc::clone(c) }));
    }
    let exec_cfg = ExecConfig {
        matmul: MatmulPreference::default()
            .with_layer(LayerKind::Linear, MatmulAlgo(10))
            .with_layer(LayerKind::Attention, MatmulAlgo(11))
            .with(LayerKind::Linear, PassKind::WeightGrad, MatmulAlgo(12)),
        ..ExecConfig::default()
    };

    let cfg = MhsaConfig::test_config();
    let mut params = MhsaParams::init(&cfg, 3);
    let exec = Executor::with_registry(exec_cfg, reg).unwrap();
    let mut acts = Activations::random_input(&cfg, 4);
    let mut scratch = Scratch::for_config(&cfg);
    compute_gradients(&exec, &cfg, &mut params, &mut acts, &mut scratch).unwrap();

    let heads = cfg.num_heads;
    let calls: Vec<usize> = counters.iter().map(|c| c.load(Ordering::Relaxed)).collect();
    // Linear forward (4) + linear input grads (w_outᵀ and 3 branches).
    assert_eq!(calls[0], 4 + 4);
    // Attention: 2 per head forward, 4 per head backward.
    assert_eq!(calls[1], 2 * heads + 4 * heads);
    // Linear weight grads: w_out and 3 input projections.
    assert_eq!(calls[2], 4);
}

#[test]
fn test_custom_kernel_used_by_executor() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut reg = KernelRegistry::<f32>::new();
    reg.register(MatmulAlgo(7), Box::new(Counting { calls: Arc::clone(&calls) }));

    let cfg = MhsaConfig::test_config();
    let params = MhsaParams::init(&cfg, 1);
    let exec = Executor::with_registry(prefer(MatmulAlgo(7), 1), reg).unwrap();
    let mut acts = Activations::random_input(&cfg, 2);
    let mut scratch = Scratch::for_config(&cfg);
    forward(&exec, &cfg, &params, &mut acts, &mut scratch).unwrap();
    // 3 projections + 2 per head + output projection, one block each.
    assert_eq!(calls.load(Ordering::Relaxed), 3 + 2 * cfg.num_heads + 1);

    let base = Executor::new(ExecConfig::default()).unwrap();
    let mut expect = Activations::random_input(&cfg, 2);
    forward(&base, &cfg, &params, &mut expect, &mut scratch).unwrap();
    assert_eq!(acts.output.data, expect.output.data);
}

#[test]
fn test_registry_mut_on_executor() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut exec = Executor::<f32>::new(prefer(MatmulAlgo(9), 1)).unwrap();
    exec.registry_mut()
        .register(MatmulAlgo(9), Box::new(Counting { calls: Arc::clone(&calls) }));
    let mut out = vec![0.0f32; 4];
    exec.matmul(
        LayerKind::Linear,
        PassKind::Forward,
        &[1.0, 2.0],
        &[3.0, 4.0],
        &mut out,
        MatmulShape::new(2, 1, 2),
    );
    assert_eq!(out, vec![3.0, 4.0, 6.0, 8.0]);
    assert_eq!(calls.load(Ordering::Relaxed), 1);
}

// ══════════════════════════════════════════════════════════════════════
// Strategy invariance of full passes
// ══════════════════════════════════════════════════════════════════════

#[test]
fn test_gradients_identical_across_strategies() {
    let cfg = MhsaConfig::new(6, 8, 8, 2);
    let run = |exec_cfg: ExecConfig| {
        let exec = Executor::<f32>::new(exec_cfg).unwrap();
        let mut params = MhsaParams::init(&cfg, 5);
        let mut acts = Activations::random_input(&cfg, 6);
        let mut scratch = Scratch::for_config(&cfg);
        let loss = compute_gradients(&exec, &cfg, &mut params, &mut acts, &mut scratch).unwrap();
        (loss, params, acts)
    };
    let base = run(prefer(NAIVE, 1));
    for algo in [UNROLL_1X4, UNROLL_2X2] {
        for workers in [1, 2, 4] {
            let got = run(prefer(algo, workers));
            assert_eq!(got.0, base.0, "loss algo={algo:?} workers={workers}");
            assert_eq!(got.1, base.1, "params algo={algo:?} workers={workers}");
            assert_eq!(got.2, base.2, "acts algo={algo:?} workers={workers}");
        }
    }
}
