mod pipelines;
mod utils;
mod config;
mod cli;

use std::env;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use log::{self, LevelFilter, debug, info, error};
use env_logger::Builder;
use crate::cli::parse;
use crate::config::defs::{RunConfig, PipelineError};
use crate::utils::system::detect_cores_and_load;
use pipelines::{bench, iteralign};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n Run Until\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}\n", dir);

    let (max_cores, cpu_load) = detect_cores_and_load(args.threads).await?;
    debug!("CPU load {}%; using {} basecall/mapping threads", cpu_load, max_cores);

    let module = args.module.clone();
    let run_config = Arc::new(RunConfig {
        cwd: dir,
        args,
        threads: max_cores,
    });

    if let Err(e) = match module.as_str() {
        "iteralign" => iteralign_run(run_config).await,
        "describe" => describe_run(run_config).await,
        "basecall_bench" => basecall_bench_run(run_config).await,
        _ => Err(PipelineError::InvalidConfig(format!("Invalid module: {}", module))),
    } {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


async fn iteralign_run(run_config: Arc<RunConfig>) -> Result<(), PipelineError> {
    iteralign::run(run_config).await
}

async fn describe_run(run_config: Arc<RunConfig>) -> Result<(), PipelineError> {
    iteralign::describe(run_config).await
}

async fn basecall_bench_run(run_config: Arc<RunConfig>) -> Result<(), PipelineError> {
    bench::run(run_config).await
}
