//! 跨模块的场景测试: 训练 -> 正则化 -> 持久化 -> 分割.

use ndarray::Array3;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::gca::NeighborHistogram;
use crate::infer::{IcmState, SegmentationContext};
use crate::params::{AnnealParams, RelabelParams, Schedule, TrainParams};
use crate::persist::assert_same_atlas;
use crate::phantom::{cube_case, train_atlas, CubePhantom};
use crate::prelude::*;

fn init_logger() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .init();
}

#[test]
fn test_persisted_atlas_segments_identically() {
    init_logger();
    let phantom = CubePhantom::new((10, 10, 10), (3, 3, 3), (4, 4, 4), 1).with_seed(11);
    let gca = train_atlas(&phantom.build(), 2.0, 2.0).unwrap();
    let mut buf = Vec::new();
    gca.write_to(&mut buf).unwrap();
    let back = Gca::read_from(buf.as_slice()).unwrap();
    assert_same_atlas(&gca, &back);

    let truth = phantom.noise_free();
    let t = Transform::identity();
    let params = RelabelParams::default();
    let (a, _) = gca.segment(&truth.scan, &t, &params, None, None).unwrap();
    let (b, _) = back.segment(&truth.scan, &t, &params, None, None).unwrap();
    assert_eq!(a, b);
}

#[test]
fn test_coordinate_chain() {
    for (node_spacing, prior_spacing) in [(1.0, 1.0), (2.0, 1.0), (2.0, 2.0), (4.0, 2.0)] {
        let g = VolumeGeometry::isotropic((8, 8, 8));
        let gca = Gca::new(1, prior_spacing, node_spacing, g.clone(), 0);
        for (x, y, z) in ndarray::indices(g.dims()) {
            let node = gca.voxel_to_node(&g, (x as f64, y as f64, z as f64)).unwrap();
            let (vx, vy, vz) = gca.node_to_voxel(&g, node).unwrap();
            if node_spacing <= 2.0 {
                assert!(vx.abs_diff(x) <= 1 && vy.abs_diff(y) <= 1 && vz.abs_diff(z) <= 1);
            }
            assert_eq!(gca.prior_to_node(gca.node_to_prior(node)), node);
        }
    }
}

#[test]
fn test_gaussian_density_integrates_to_one() {
    let mut gc = Gc1d::new(1);
    gc.means[0] = 3.0;
    gc.covars[0] = 4.0;
    let h = 0.01;
    let mut total = 0.0;
    for i in 0..8000 {
        let v = -37.0 + (i as f64 + 0.5) * h;
        let p = gc.density(&[v as f32]);
        assert!(p >= 0.0);
        total += p * h;
    }
    assert!((total - 1.0).abs() < 1e-4, "{total}");
    let v = 7.5f32;
    assert!((gc.mahalanobis(&[v]) - (4.5 * 4.5 / 4.0)).abs() < 1e-9);

    let mut gc = Gc1d::new(2);
    gc.means = vec![1.0, -2.0];
    gc.covars = vec![4.0, 1.0, 2.0];
    let h = 0.1;
    let mut total = 0.0;
    for i in 0..300 {
        for j in 0..300 {
            let v = [1.0 - 15.0 + (i as f64 + 0.5) * h, -2.0 - 15.0 + (j as f64 + 0.5) * h];
            let p = gc.density(&[v[0] as f32, v[1] as f32]);
            assert!(p >= 0.0);
            total += p * h * h;
        }
    }
    assert!((total - 1.0).abs() < 1e-3, "{total}");
}

#[test]
fn test_covariances_invertible_after_training() {
    init_logger();
    let case = cube_case((10, 10, 10), (3, 3, 3), (4, 4, 4), 2, 5);
    let gca = train_atlas(&case, 2.0, 2.0).unwrap();
    let mut n = 0;
    for node in gca.nodes().iter() {
        for gc in node.gcs() {
            assert!(gc.determinant() > 0.0);
            assert!(gc.is_invertible());
            n += 1;
        }
    }
    assert!(n > 125);
}

#[test]
fn test_renormalization_keeps_label_order() {
    let g = VolumeGeometry::isotropic((4, 4, 4));
    let mut gca = Gca::new(1, 4.0, 4.0, g, 0);
    let node = gca.node_mut((0, 0, 0));
    for (label, mean) in [(3, 90.0), (2, 110.0)] {
        let i = node.find_or_insert(label, 1);
        node.gcs_mut()[i].means[0] = mean;
        node.gcs_mut()[i].covars[0] = 25.0;
    }
    // 峰值检测把标签 3 放在 120, 标签 2 放在 100, 与图谱中的次序相反
    let scales = gca.renormalize_labels(0, &[(3, 120.0), (2, 100.0)]).unwrap();
    let a = gca.label_mean(3, 0).unwrap();
    let b = gca.label_mean(2, 0).unwrap();
    assert!(a < b);
    assert!((a - 99.0).abs() < 1e-3, "{a}");
    assert!((b - 121.0).abs() < 1e-3, "{b}");
    assert!((scales[&3] - 1.1).abs() < 1e-9);
}

/// 两个标签, 均值 50 与 200, 标准差 5. 每个 node 都有两个分类器,
/// 邻居直方图中同标签 0.9, 异标签 0.1.
fn bimodal_atlas(g: &VolumeGeometry) -> Gca {
    let mut gca = Gca::new(1, 1.0, 1.0, g.clone(), 0);
    let gc = |label: Label, mean: f32| {
        let mut gc = Gc1d::new(1);
        gc.means[0] = mean;
        gc.covars[0] = 25.0;
        gc.ntraining = 10;
        gc.nbrs = std::array::from_fn(|_| {
            NeighborHistogram::from_entries(vec![label, 1 - label], vec![0.9, 0.1])
        });
        gc
    };
    for node in gca.nodes_mut().iter_mut() {
        *node = GcaNode::from_entries(vec![0, 1], vec![gc(0, 50.0), gc(1, 200.0)], 10);
    }
    for prior in gca.priors_mut().iter_mut() {
        *prior = GcaPrior::from_entries(vec![0, 1], vec![0.5, 0.5], 10);
    }
    gca
}

#[test]
fn test_icm_recovers_perturbed_labels() {
    init_logger();
    let phantom = CubePhantom::new((5, 5, 5), (1, 1, 1), (3, 3, 3), 1)
        .with_means(vec![(50.0, 200.0)])
        .with_sigmas(5.0, 5.0)
        .with_seed(3);
    let case = phantom.build();
    let gca = bimodal_atlas(case.scan.geometry());
    let ctx = SegmentationContext::new(&gca, &case.scan, &Transform::identity()).unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    let mut voxels: Vec<Idx3d> = ndarray::indices((5, 5, 5)).into_iter().collect();
    voxels.shuffle(&mut rng);
    for schedule in [Schedule::Sequential, Schedule::Parallel] {
        let mut labels = case.labels.clone();
        for &pos in &voxels[..25] {
            labels[pos] = 1 - labels[pos];
        }
        assert_eq!(labels.diff_count(&case.labels).unwrap(), 25);

        let params = RelabelParams {
            schedule,
            ..Default::default()
        };
        let report = gca
            .reclassify_using_gibbs_priors(&ctx, &mut labels, None, &params, None)
            .unwrap();
        assert_eq!(report.state, IcmState::Converged);
        assert_eq!(labels.diff_count(&case.labels).unwrap(), 0);
    }
}

#[test]
fn test_icm_result_is_fixed_point() {
    init_logger();
    // 中心体素的强度略偏向标签 1, 邻居全部为标签 0
    let g = VolumeGeometry::isotropic((5, 5, 5));
    let mut values = Array3::from_elem((5, 5, 5), 50.0f32);
    values[(2, 2, 2)] = 125.83;
    let scan = MriScan::from_channels(g.clone(), &[values]).unwrap();
    let gca = bimodal_atlas(&g);
    let ctx = SegmentationContext::new(&gca, &scan, &Transform::identity()).unwrap();

    for schedule in [Schedule::Sequential, Schedule::Parallel] {
        let params = RelabelParams {
            schedule,
            ..Default::default()
        };
        let mut labels = gca.label_map(&ctx, None);
        assert_eq!(labels[(2, 2, 2)], 1);
        let report = gca
            .reclassify_using_gibbs_priors(&ctx, &mut labels, None, &params, None)
            .unwrap();
        assert_eq!(report.state, IcmState::Converged);
        assert_eq!(report.prior_factor, params.max_prior_factor);
        assert_eq!(labels.count(0), 125);

        // 在最终权重下重新运行, 不应再有任何改变
        let again = RelabelParams {
            prior_factor: params.max_prior_factor,
            ..params
        };
        let mut rerun = labels.clone();
        let report = gca
            .reclassify_using_gibbs_priors(&ctx, &mut rerun, None, &again, None)
            .unwrap();
        assert_eq!(report.state, IcmState::Converged);
        assert!(report.changed.iter().all(|&n| n == 0), "{:?}", report.changed);
        assert_eq!(rerun, labels);
    }
}

#[test]
fn test_neighbor_tables_keep_direction() {
    // 标签 1 占据 x < 3, 标签 2 占据 x >= 3: 1 的 +x 邻居可能是 2, -x 邻居永远不是
    let g = VolumeGeometry::isotropic((6, 2, 2));
    let labels = Array3::from_shape_fn((6, 2, 2), |(x, _, _)| if x < 3 { 1 } else { 2 });
    let labels = MriLabel::from_array(g.clone(), labels).unwrap();
    let values = Array3::from_shape_fn((6, 2, 2), |(x, _, _)| if x < 3 { 80.0 } else { 120.0 });
    let scan = MriScan::from_channels(g.clone(), &[values]).unwrap();

    let mut gca = Gca::new(1, 1.0, 1.0, g, 0);
    gca.train(&scan, &labels, &Transform::identity(), None, &TrainParams::default())
        .unwrap();
    gca.complete_mean_training();

    let gc = gca.find_classifier((2, 0, 0), 1).unwrap();
    assert_eq!(gc.neighbor_prior(Direction::XPos, 2), Some(1.0));
    assert_eq!(gc.neighbor_prior(Direction::XNeg, 2), None);
    assert_eq!(gc.neighbor_prior(Direction::XNeg, 1), Some(1.0));

    let gc = gca.find_classifier((3, 0, 0), 2).unwrap();
    assert_eq!(gc.neighbor_prior(Direction::XNeg, 1), Some(1.0));
    assert_eq!(gc.neighbor_prior(Direction::XPos, 1), None);
}

#[test]
fn test_end_to_end_two_channel_cube() {
    init_logger();
    let phantom = CubePhantom::new((10, 10, 10), (3, 3, 3), (4, 4, 4), 2).with_seed(2024);
    let gca = train_atlas(&phantom.build(), 2.0, 2.0).unwrap();
    assert_eq!(gca.labels_present().into_iter().collect::<Vec<_>>(), vec![0, 1]);

    let truth = phantom.noise_free();
    let t = Transform::identity();
    let (labels, report) = gca
        .segment(&truth.scan, &t, &RelabelParams::default(), None, None)
        .unwrap();
    assert_eq!(labels.diff_count(&truth.labels).unwrap(), 0);
    assert_eq!(report.state, IcmState::Converged);

    let (labels, _) = gca
        .segment(&truth.scan, &t, &RelabelParams::default(), Some(&AnnealParams::default()), None)
        .unwrap();
    assert_eq!(labels, truth.labels);

    let atlas = SharedAtlas::new(gca);
    std::thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                let gca = atlas.read();
                let (labels, _) = gca
                    .segment(&truth.scan, &t, &RelabelParams::default(), None, None)
                    .unwrap();
                assert_eq!(labels, truth.labels);
            });
        }
    });
}
