//! 程序运行函数.

use std::thread;

use gca_berry::phantom::{train_atlas, PhantomCase};
use gca_berry::SharedAtlas;

use crate::result::AblationResult;

/// 测试体模个数 (不含训练用的一个).
const TEST_CASES: usize = 8;

/// 实际运行.
pub fn run() -> AblationResult {
    let suite = utils::phantom_suite(TEST_CASES + 1);
    let atlas = match train_atlas(&suite[0].build(), 2.0, 2.0) {
        Ok(gca) => SharedAtlas::new(gca),
        Err(e) => panic!("Training atlas error: {e}"),
    };
    let cases: Vec<PhantomCase> = suite[1..].iter().map(|p| p.build()).collect();
    let cases = cases.as_slice();
    let atlas = &atlas;

    println!("Running ablation studies...");
    thread::scope(|s| {
        use crate::strategies::*;

        let handles = [
            map_only,
            icm_sequential,
            icm_parallel,
            icm_unsorted,
            anneal_then_icm,
            icm_from_perturbed,
        ]
        .map(|t| s.spawn(move || t(&atlas.read(), cases)));

        AblationResult::from_iter(
            [
                "map-only",
                "icm-sequential",
                "icm-parallel",
                "icm-unsorted",
                "anneal+icm",
                "icm-perturbed-20%",
            ]
            .into_iter()
            .zip(
                handles
                    .into_iter()
                    .map(|th| th.join().expect("Thread joining error")),
            ),
        )
    })
}
