/// Property tests over random layer shapes.

use proptest::prelude::*;

use mhsa_core::gradient::compute_gradients;
use mhsa_core::model::ExecConfig;
use mhsa_core::parallel::partition;
use mhsa_core::{
    forward, forward_double_buffered, Activations, Executor, MhsaConfig, MhsaParams, Scratch,
    TilingConfig,
};

/// (L, E, F, heads) with heads dividing F.
fn layer_shape() -> impl Strategy<Value = MhsaConfig> {
    (1usize..7, 1usize..7, 1usize..4, 1usize..4).prop_map(|(l, e, h, heads)| {
        MhsaConfig::new(l, e, h * heads, heads)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_forward_shapes_and_softmax(cfg in layer_shape(), seed in 1u64..1000, workers in 1usize..4) {
        let exec = Executor::<f32>::new(ExecConfig::with_workers(workers)).unwrap();
        let params = MhsaParams::init(&cfg, seed);
        let mut acts = Activations::random_input(&cfg, seed + 1);
        let mut scratch = Scratch::for_config(&cfg);
        forward(&exec, &cfg, &params, &mut acts, &mut scratch).unwrap();

        let (l, e, f) = (cfg.seq_len, cfg.embed_dim, cfg.hidden_dim);
        prop_assert_eq!(acts.output.shape(), (e, l));
        prop_assert_eq!(acts.q.shape(), (f, l));
        prop_assert_eq!(acts.attention_map.shape(), (f, l));
        prop_assert_eq!(acts.softmax_buffer.shape(), (cfg.num_heads * l, l));
        prop_assert!(acts.output.data.iter().all(|v| v.is_finite()));
        for row in acts.softmax_buffer.data.chunks(l) {
            let s: f32 = row.iter().sum();
            prop_assert!((s - 1.0).abs() < 1e-5);
            prop_assert!(row.iter().all(|&p| (0.0..=1.0).contains(&p)));
        }
    }

    #[test]
    fn prop_tiled_matches_plain(cfg in layer_shape(), seed in 1u64..1000, pick in 0usize..8) {
        let divisors: Vec<usize> = (1..=cfg.hidden_dim).filter(|d| cfg.hidden_dim % d == 0).collect();
        let tiling = TilingConfig::new(divisors[pick % divisors.len()]);
        let exec = Executor::<f32>::new(ExecConfig::default()).unwrap();
        let params = MhsaParams::init(&cfg, seed);
        let mut plain = Activations::random_input(&cfg, seed + 1);
        let mut tiled = plain.clone();
        let mut scratch = Scratch::for_config(&cfg);
        forward(&exec, &cfg, &params, &mut plain, &mut scratch).unwrap();
        forward_double_buffered(&exec, &cfg, &tiling, &params, &mut tiled, &mut scratch).unwrap();
        prop_assert_eq!(plain, tiled);
    }

    #[test]
    fn prop_gradients_finite_and_shaped(cfg in layer_shape(), seed in 1u64..1000) {
        let exec = Executor::<f64>::new(ExecConfig::default()).unwrap();
        let mut params = MhsaParams::init(&cfg, seed);
        let mut acts = Activations::random_input(&cfg, seed + 1);
        let mut scratch = Scratch::for_config(&cfg);
        compute_gradients(&exec, &cfg, &mut params, &mut acts, &mut scratch).unwrap();
        for t in [&params.w_in_q, &params.w_in_v, &params.b_in_q, &params.w_out, &acts.input] {
            let g = t.grad().unwrap();
            prop_assert_eq!(g.len(), t.numel());
            prop_assert!(g.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn prop_partition_is_exact_cover(len in 0usize..200, workers in 1usize..17) {
        let mut next = 0;
        for id in 0..workers {
            let r = partition(len, workers, id);
            prop_assert_eq!(r.start, next);
            prop_assert!(r.len() <= len.div_ceil(workers).max(1));
            next = r.end;
        }
        prop_assert_eq!(next, len);
    }
}
