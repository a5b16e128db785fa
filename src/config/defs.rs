use std::fmt;
use std::path::PathBuf;
use crate::cli::Arguments;

// External software
pub const MINIMAP2_TAG: &str = "minimap2";
pub const MINIMAP2_PRESET: &str = "map-ont";

// Static Filenames
pub const LIVE_TOML_SUFFIX: &str = "_live";
pub const INDEX_FILENAME: &str = "reference.mmi";

// Static Parameters
pub const DEFAULT_COVERAGE_DEPTH: usize = 30;
pub const DEFAULT_PERCENTAGE_COVERED: f64 = 0.99;
pub const DEFAULT_CORES: usize = 2;
pub const DEFAULT_EVICT_INTERVAL_SECS: u64 = 1800;
pub const DEFAULT_WATCH_POLL_SECS: u64 = 5;
pub const DEFAULT_SIGNAL_CHUNK: usize = 4000;
pub const DEFAULT_IDLE_POLL_MS: u64 = 1;
pub const MAP_BATCH_SIZE: usize = 500;
pub const DEFAULT_TAXON_THRESHOLD: u64 = 100;

// Stall trimming ahead of decoding
pub const TRIM_WINDOW: usize = 40;
pub const TRIM_THRESHOLD_FACTOR: f32 = 3.0;
pub const TRIM_MIN_ELEMENTS: usize = 3;

pub const MINION_CHANNELS: usize = 512;
pub const PROMETHION_CHANNELS: usize = 3000;

pub const GZIP_EXT: &str = "gz";
pub const FASTQ_EXTS: &[&'static str] = &["fastq", "fq"];
pub const FASTA_EXTS: &[&'static str] = &["fasta", "fa", "fna"];
pub const REPORT_EXTS: &[&'static str] = &["tsv", "txt"];

/// Name the watch-mode reference is registered under.
pub const WATCH_REFERENCE_NAME: &str = "reference";
/// Prefix of references registered for classified taxa, followed by the taxid.
pub const TAXON_REFERENCE_PREFIX: &str = "taxid_";


#[derive(Debug)]
pub enum PipelineError {
    InvalidConfig(String),
    IOError(String),
    UnknownFlowcell(usize),
    InvalidChannel { channel: u32, flowcell_size: usize },
    UnevenSplit { split: usize, axis: usize, dimension: usize },
    UnknownReadId(String),
    IndexLoad { name: String, error: String },
    IndexUnavailable(String),
    ToolExecution { tool: String, error: String },
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            PipelineError::IOError(msg) => write!(f, "I/O error: {}", msg),
            PipelineError::UnknownFlowcell(size) => {
                write!(f, "Flowcell size {} is not recognised", size)
            }
            PipelineError::InvalidChannel { channel, flowcell_size } => write!(
                f,
                "Channel {} is outside of the flowcell bounds (1, {})",
                channel, flowcell_size
            ),
            PipelineError::UnevenSplit { split, axis, dimension } => write!(
                f,
                "The flowcell cannot be split evenly: {} does not divide {} along axis {}",
                split, dimension, axis
            ),
            PipelineError::UnknownReadId(read_id) => {
                write!(f, "Basecaller returned read {} which was never submitted", read_id)
            }
            PipelineError::IndexLoad { name, error } => {
                write!(f, "Failed to load reference index {}: {}", name, error)
            }
            PipelineError::IndexUnavailable(name) => {
                write!(f, "Reference index {} is not loaded", name)
            }
            PipelineError::ToolExecution { tool, error } => {
                write!(f, "{} failed: {}", tool, error)
            }
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}


pub struct RunConfig {
    pub cwd: PathBuf,
    pub args: Arguments,
    pub threads: usize,
}
