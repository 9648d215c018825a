//! 比较几种重标注策略在合成体模上的精度与耗时.

mod result;
mod runner;
mod strategies;

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .expect("logger already initialised");
    log::info!("{} cores available", utils::cpus());
    runner::run().analyze();
}
