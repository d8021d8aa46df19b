//! Property-based tests for the clustering pipeline.
//!
//! - Loss ignores the order of the two clusters
//! - Loss is non-negative and finite for sane inputs
//! - kNN neighbors stay inside the valid region
//! - Output head rows lie on the simplex

use candle_core::{DType, Device, Tensor, D};
use proptest::prelude::*;

fn softmax_rows(raw: &[f32], classes: usize) -> Vec<f32> {
    raw.chunks(classes)
        .flat_map(|row| {
            let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let exp: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
            let total: f32 = exp.iter().sum();
            exp.into_iter().map(move |e| e / total)
        })
        .collect()
}

fn arb_cloud(max_n: usize) -> impl Strategy<Value = (usize, Vec<f32>, Vec<f32>, Vec<f32>)> {
    (2..=max_n).prop_flat_map(|n| {
        (
            Just(n),
            prop::collection::vec(-3.0f32..3.0, n * 3),
            prop::collection::vec(0.0f32..1.0, n * 2),
            prop::collection::vec(0.01f32..50.0, n),
        )
    })
}

mod loss_props {
    use super::*;
    use hitgraph::{LossConfig, PermutationInvariantLoss};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn loss_invariant_under_cluster_swap((n, raw, truth, energy) in arb_cloud(12)) {
            let device = Device::Cpu;
            let loss = PermutationInvariantLoss::new(LossConfig::default()).unwrap();

            let p = Tensor::from_vec(softmax_rows(&raw, 3), (1, n, 3), &device).unwrap();
            let swapped: Vec<f32> = truth.chunks(2).flat_map(|c| [c[1], c[0]]).collect();
            let t = Tensor::from_vec(truth, (1, n, 2), &device).unwrap();
            let ts = Tensor::from_vec(swapped, (1, n, 2), &device).unwrap();
            let e = Tensor::from_vec(energy, (1, n), &device).unwrap();

            let a = loss.compute(&p, &t, &e, &[n]).unwrap().value().unwrap();
            let b = loss.compute(&p, &ts, &e, &[n]).unwrap().value().unwrap();
            prop_assert!((a - b).abs() <= 1e-5 * (1.0 + a.abs()), "{} vs {}", a, b);
        }

        #[test]
        fn loss_is_finite_and_non_negative(
            (n, raw, truth, energy) in arb_cloud(12),
            valid_fraction in 0.0f64..=1.0,
        ) {
            let device = Device::Cpu;
            let loss = PermutationInvariantLoss::new(LossConfig::default()).unwrap();
            let valid = (n as f64 * valid_fraction).round() as usize;

            let p = Tensor::from_vec(softmax_rows(&raw, 3), (1, n, 3), &device).unwrap();
            let t = Tensor::from_vec(truth, (1, n, 2), &device).unwrap();
            let e = Tensor::from_vec(energy, (1, n), &device).unwrap();

            let out = loss.compute(&p, &t, &e, &[valid]).unwrap();
            let value = out.value().unwrap();
            prop_assert!(value.is_finite());
            prop_assert!(value >= 0.0);
            if valid == 0 {
                prop_assert_eq!(value, 0.0);
            }
        }
    }
}

mod knn_props {
    use super::*;
    use hitgraph::knn;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn neighbors_stay_valid(
            (n, coords, _, _) in arb_cloud(16),
            k in 1usize..4,
            valid_fraction in 0.0f64..=1.0,
        ) {
            prop_assume!(k <= n);
            let device = Device::Cpu;
            let valid = (n as f64 * valid_fraction).round() as usize;
            let latent = Tensor::from_vec(coords, (1, n, 3), &device).unwrap();

            let index = knn(&latent, &[valid], k).unwrap();
            let neighbors = index.to_vec3();
            let mask = index.mask().to_vec3::<f32>().unwrap();

            for i in 0..valid {
                for slot in 0..k {
                    let j = neighbors[0][i][slot];
                    if mask[0][i][slot] > 0.0 {
                        prop_assert!(j < valid);
                        prop_assert_ne!(j, i);
                    }
                }
                let real = mask[0][i].iter().filter(|&&m| m > 0.0).count();
                prop_assert_eq!(real, k.min(valid - 1));
            }
        }
    }
}

mod head_props {
    use super::*;
    use candle_nn::{Module, VarBuilder, VarMap};
    use hitgraph::head::OutputHead;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn head_rows_on_simplex(
            n in 1usize..10,
            width in 1usize..8,
            classes in 2usize..5,
        ) {
            let device = Device::Cpu;
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            let head = OutputHead::new(width, classes, vb).unwrap();

            let x = Tensor::randn(0f32, 5f32, (2, n, width), &device).unwrap();
            let p = head.forward(&x).unwrap();
            prop_assert_eq!(p.dims(), &[2, n, classes]);

            let sums = p.sum(D::Minus1).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
            for s in sums {
                prop_assert!((s - 1.0).abs() < 1e-5);
            }
        }
    }
}
