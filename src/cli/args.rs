use clap::Parser;
use crate::config::defs::{
    DEFAULT_CORES, DEFAULT_COVERAGE_DEPTH, DEFAULT_EVICT_INTERVAL_SECS, DEFAULT_PERCENTAGE_COVERED,
    DEFAULT_TAXON_THRESHOLD, DEFAULT_WATCH_POLL_SECS, MINION_CHANNELS,
};

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "run-until", version, about = "Run Until: adaptive sampling with live coverage tracking")]
pub struct Arguments {

    #[arg(short, long, help = "One of iteralign, describe, basecall_bench")]
    pub module: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(long, help = "Experiment TOML describing the conditions")]
    pub toml: Option<String>,

    #[arg(long, help = "Top level folder containing fastq reads. Replaces the live instrument feed.")]
    pub watch: Option<String>,

    #[arg(long, default_value_t = DEFAULT_PERCENTAGE_COVERED, help = "Fraction of targets covered at the given depth")]
    pub percent: f64,

    #[arg(long, default_value_t = DEFAULT_COVERAGE_DEPTH, help = "Desired coverage depth")]
    pub depth: usize,

    #[arg(long, default_value_t = DEFAULT_CORES)]
    pub threads: usize,

    #[arg(long, default_value_t = MINION_CHANNELS, help = "Channel count of the flowcell (512 or 3000)")]
    pub channels: usize,

    #[clap(long, help = "Optional fixed seed for the condition shuffle; defaults to OS entropy")]
    pub seed: Option<u64>,

    #[arg(long, help = "Folder of classifier reports (tsv) to follow during iteralign")]
    pub reports: Option<String>,

    #[arg(long, help = "Folder of <taxid>.fasta references for taxa found in the reports")]
    pub references: Option<String>,

    #[arg(long, default_value_t = DEFAULT_TAXON_THRESHOLD, help = "Unique reads a taxon needs before its reference is added")]
    pub taxon_threshold: u64,

    #[arg(long, default_value_t = DEFAULT_EVICT_INTERVAL_SECS)]
    pub evict_interval_secs: u64,

    #[arg(long, default_value_t = DEFAULT_WATCH_POLL_SECS)]
    pub watch_poll_secs: u64,

    #[arg(long, default_value_t = 0, help = "Minimum delay in ms between basecaller submissions, also the sleep after an empty poll (0 = no spacing, 1 ms idle)")]
    pub poll_throttle_ms: u64,

    #[arg(long, default_value_t = 4, help = "Number of read batches for basecall_bench")]
    pub bench_rounds: u32,
}
