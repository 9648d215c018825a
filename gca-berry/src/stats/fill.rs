//! 最近同标签分类器搜索, 用于空洞填充与奇异协方差修复.

use std::collections::HashSet;

use binary_heap_plus::BinaryHeap;
use ndarray::Array3;

use crate::gca::{Direction, GcaNode};
use crate::{Idx3d, Idx3dU16};

/// &Idx3d -> Idx3dU16
#[inline]
const fn idx3d_to_u16((x, y, z): &Idx3d) -> Idx3dU16 {
    // Usize to uShort
    (*x as u16, *y as u16, *z as u16)
}

#[inline]
fn distance_squared(a: Idx3d, b: Idx3d) -> usize {
    a.0.abs_diff(b.0).pow(2) + a.1.abs_diff(b.1).pow(2) + a.2.abs_diff(b.2).pow(2)
}

/// 从 `start` 出发寻找最近的满足 `accept` 的 node 单元 (不含 `start` 本身).
///
/// 先在边长 `2 * radius + 1` 的立方窗口内穷举, 找不到时在整张网格上做 best-first 搜索.
pub(crate) fn nearest_node<F>(
    nodes: &Array3<GcaNode>,
    start: Idx3d,
    radius: usize,
    accept: F,
) -> Option<Idx3d>
where
    F: Fn(Idx3d, &GcaNode) -> bool,
{
    let dims = nodes.dim();
    let lo = |v: usize| v.saturating_sub(radius);
    let hi = |v: usize, n: usize| (v + radius + 1).min(n);

    let mut best: Option<(usize, Idx3d)> = None;
    for x in lo(start.0)..hi(start.0, dims.0) {
        for y in lo(start.1)..hi(start.1, dims.1) {
            for z in lo(start.2)..hi(start.2, dims.2) {
                let pos = (x, y, z);
                if pos == start || !accept(pos, &nodes[pos]) {
                    continue;
                }
                let dist = distance_squared(start, pos);
                if best.map_or(true, |(d, _)| dist < d) {
                    best = Some((dist, pos));
                }
            }
        }
    }
    if let Some((_, pos)) = best {
        return Some(pos);
    }

    // 堆顶距 `start` 最近
    let mut heap: BinaryHeap<Idx3d, _> = BinaryHeap::new_by(|a: &Idx3d, b: &Idx3d| {
        distance_squared(start, *b).cmp(&distance_squared(start, *a))
    });
    heap.reserve(64);
    heap.push(start);
    let mut visited = HashSet::<Idx3dU16>::with_capacity(64);

    while let Some(pos) = heap.pop() {
        let pos_u16 = idx3d_to_u16(&pos);
        if visited.contains(&pos_u16) {
            continue;
        }
        visited.insert(pos_u16);
        if pos != start && accept(pos, &nodes[pos]) {
            return Some(pos);
        }
        for dir in Direction::ALL {
            if let Some(n) = dir.step(pos, dims) {
                if !visited.contains(&idx3d_to_u16(&n)) {
                    heap.push(n);
                }
            }
        }
    }
    None
}
