//! 参与比较的重标注策略.

mod profile;

use gca_berry::phantom::PhantomCase;
use gca_berry::prelude::*;

pub use profile::Profile;

/// 初始标注的来源.
#[derive(Copy, Clone, Debug)]
enum Start {
    /// 不考虑 MRF 的逐体素 MAP.
    Map,
    /// 真值随机翻转一部分体素.
    Perturbed(f64),
}

/// 在全部测试体模上运行一种策略.
fn evaluate(
    gca: &Gca,
    cases: &[PhantomCase],
    start: Start,
    relabel: Option<&RelabelParams>,
    anneal: Option<&AnnealParams>,
) -> Profile {
    let mut profile = Profile::new();
    let transform = Transform::identity();
    for (i, case) in cases.iter().enumerate() {
        let ctx = match SegmentationContext::new(gca, &case.scan, &transform) {
            Ok(ctx) => ctx,
            Err(e) => {
                log::error!("case {i}: {e}");
                continue;
            }
        };
        let mut labels = match start {
            Start::Map => gca.label_map(&ctx, None),
            Start::Perturbed(f) => utils::perturb(&case.labels, f, i as u64),
        };

        profile.work_start();
        let outcome = anneal
            .map(|p| gca.anneal(&ctx, &mut labels, None, p, None).map(|_| ()))
            .transpose()
            .and_then(|_| {
                relabel
                    .map(|p| gca.reclassify_using_gibbs_priors(&ctx, &mut labels, None, p, None))
                    .transpose()
            });
        profile.work_elapsed();

        let report = match outcome {
            Ok(report) => report,
            Err(e) => {
                log::error!("case {i}: {e}");
                continue;
            }
        };
        let (passes, converged) = report.map_or((0, true), |r| {
            (r.passes(), r.state == IcmState::Converged)
        });
        let errors = labels.diff_count(&case.labels).unwrap_or(usize::MAX);
        log::debug!("case {i}: {errors} errors, {passes} passes");
        profile.count_case(labels.size(), errors, passes, converged);
    }
    profile.finish()
}

pub fn map_only(gca: &Gca, cases: &[PhantomCase]) -> Profile {
    evaluate(gca, cases, Start::Map, None, None)
}

pub fn icm_sequential(gca: &Gca, cases: &[PhantomCase]) -> Profile {
    evaluate(gca, cases, Start::Map, Some(&RelabelParams::default()), None)
}

pub fn icm_parallel(gca: &Gca, cases: &[PhantomCase]) -> Profile {
    let params = RelabelParams {
        schedule: Schedule::Parallel,
        ..Default::default()
    };
    evaluate(gca, cases, Start::Map, Some(&params), None)
}

pub fn icm_unsorted(gca: &Gca, cases: &[PhantomCase]) -> Profile {
    let params = RelabelParams {
        sort_first_pass: false,
        ..Default::default()
    };
    evaluate(gca, cases, Start::Map, Some(&params), None)
}

pub fn anneal_then_icm(gca: &Gca, cases: &[PhantomCase]) -> Profile {
    let anneal = AnnealParams {
        max_iter: 20,
        ..Default::default()
    };
    evaluate(gca, cases, Start::Map, Some(&RelabelParams::default()), Some(&anneal))
}

pub fn icm_from_perturbed(gca: &Gca, cases: &[PhantomCase]) -> Profile {
    evaluate(gca, cases, Start::Perturbed(0.2), Some(&RelabelParams::default()), None)
}
