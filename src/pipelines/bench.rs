// src/pipelines/bench.rs: Throughput benchmark for the basecall dispatcher
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use fxhash::FxHashMap as HashMap;
use log::{info, warn};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::config::conditions::{CallerSettings, ExperimentConfig};
use crate::config::defs::{PipelineError, RunConfig, DEFAULT_SIGNAL_CHUNK, MINION_CHANNELS};
use crate::utils::basecall::{BasecallBackend, BasecallDispatcher, Basecaller, QuantizingDecoder, RawRead};
use crate::utils::system::generate_rng;


/// Synthetic reads of Normal-distributed signal, spread over the flowcell channels.
///
/// # Arguments
///
/// * `rng` - Random source.
/// * `count` - Number of reads.
/// * `samples` - Signal length per read.
/// * `offset` - First read number, keeps ids unique across batches.
pub fn synthetic_reads<R: Rng>(rng: &mut R, count: usize, samples: usize, offset: usize) -> Result<Vec<RawRead>, PipelineError> {
    let normal = Normal::new(90.0f32, 15.0f32)
        .map_err(|e| PipelineError::InvalidConfig(format!("Bad signal distribution: {}", e)))?;
    Ok((0..count)
        .map(|i| {
            let number = offset + i;
            RawRead {
                channel: (number % MINION_CHANNELS) as u32 + 1,
                read_number: number as u32,
                read_id: format!("bench-{:08}", number),
                signal: (0..samples).map(|_| normal.sample(&mut *rng).round() as i16).collect(),
            }
        })
        .collect())
}


/// Submits one batch and drains it.
///
/// # Returns
/// (results received, errors received)
pub async fn run_batch<B: BasecallBackend>(
    dispatcher: &mut BasecallDispatcher<B>,
    reads: Vec<RawRead>,
) -> (usize, usize) {
    let decided: HashMap<u32, String> = HashMap::default();
    dispatcher.submit(reads, &decided).await;

    let mut ok = 0;
    let mut failed = 0;
    let mut results = std::pin::pin!(dispatcher.drain());
    while let Some(result) = results.next().await {
        match result {
            Ok(_) => ok += 1,
            Err(e) => {
                warn!("{}", e);
                failed += 1;
            }
        }
    }
    (ok, failed)
}


pub async fn run(config: Arc<RunConfig>) -> Result<(), PipelineError> {
    let args = &config.args;
    let settings = match &args.toml {
        Some(toml) => ExperimentConfig::load(config.cwd.join(toml), args.seed)?.caller_settings,
        None => CallerSettings::default(),
    };

    let backend = Basecaller::from_settings(&settings, config.threads, Arc::new(QuantizingDecoder::default()))?;
    let mut dispatcher = BasecallDispatcher::new(backend, Duration::from_millis(args.poll_throttle_ms));
    let mut rng = generate_rng(args.seed);

    let mut offset = 0;
    for round in 1..=args.bench_rounds {
        let count = 7usize.pow(round);
        let reads = synthetic_reads(&mut rng, count, DEFAULT_SIGNAL_CHUNK, offset)?;
        offset += count;

        let start = Instant::now();
        let (ok, failed) = run_batch(&mut dispatcher, reads).await;
        let elapsed = start.elapsed();
        info!(
            "Basecalled {} reads ({} failed) in {:.3}s, {:.1} reads/s",
            ok,
            failed,
            elapsed.as_secs_f64(),
            ok as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
        );
    }

    dispatcher.shutdown();
    Ok(())
}
