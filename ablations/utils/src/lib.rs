//! 消融实验依赖的通用组件.

use gca_berry::phantom::CubePhantom;
use gca_berry::MriLabel;
use rand::rngs::StdRng;
use rand::seq::index;
use rand::SeedableRng;

const SEP: &str = "--------------------------------------------------------";

/// 简单分隔线.
#[inline]
pub fn sep() {
    println!("{SEP}");
}

/// 简单分隔线.
#[inline]
pub fn sep_to<W: std::io::Write>(mut w: W) -> std::io::Result<()> {
    writeln!(&mut w, "{SEP}")
}

/// 获得可并行核心数.
pub fn cpus() -> usize {
    std::thread::available_parallelism().map_or_else(|_| num_cpus::get(), usize::from)
}

/// 实验用的一组体模: 同一立方体位置, 不同噪声种子.
///
/// 第一个用于训练图谱, 其余用于测试.
pub fn phantom_suite(n: usize) -> Vec<CubePhantom> {
    (0..n as u64)
        .map(|seed| CubePhantom::new((16, 16, 16), (5, 5, 5), (6, 6, 6), 2).with_seed(seed))
        .collect()
}

/// 随机翻转 `fraction` 比例的体素标签 (在 `labels` 中出现过的标签之间轮换).
pub fn perturb(labels: &MriLabel, fraction: f64, seed: u64) -> MriLabel {
    assert!((0.0..=1.0).contains(&fraction), "比例必须在 [0, 1] 内");
    let present: Vec<u8> = labels.histogram().into_keys().collect();
    let mut out = labels.clone();
    if present.len() < 2 {
        return out;
    }
    let voxels: Vec<_> = labels.data().indexed_iter().map(|(pos, _)| pos).collect();
    let amount = (voxels.len() as f64 * fraction).round() as usize;
    let mut rng = StdRng::seed_from_u64(seed);
    for i in index::sample(&mut rng, voxels.len(), amount) {
        let pos = voxels[i];
        let k = present.iter().position(|&l| l == out[pos]).unwrap_or(0);
        out[pos] = present[(k + 1) % present.len()];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perturb_flips_exact_fraction() {
        let case = phantom_suite(1)[0].noise_free();
        let flipped = perturb(&case.labels, 0.25, 9);
        assert_eq!(flipped.diff_count(&case.labels).unwrap(), 1024);
        assert_eq!(perturb(&case.labels, 0.0, 9), case.labels);
    }
}
