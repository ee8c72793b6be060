use camino::Utf8PathBuf;
use thiserror::Error;

pub use anyhow::Error as RuntimeError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Error while assembling the pipeline:\n{0}")]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error("Error while loading the cache tables:\n{0}")]
    Cache(#[from] CacheError),

    #[error("Error while fetching datasets:\n{0}")]
    Fetch(#[from] FetchError),

    #[error("Error while extracting widefield data:\n{0}")]
    Extract(#[from] ExtractError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read parameters file.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't parse parameters file.\n{0}")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Task '{task}' depends on '{parent}', which was never created")]
    MissingParent { task: String, parent: String },

    #[error("Task '{0}' was declared twice")]
    DuplicateTask(String),

    #[error("Invalid acquisition description: {0}")]
    InvalidDescription(String),

    #[error("Cycle detected in task graph at '{0}'")]
    Cycle(String),

    #[error(transparent)]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("{0} is not a valid eID/UUID string")]
    InvalidEid(String),

    #[error("{0} is not a valid experiment reference")]
    InvalidRef(String),

    #[error("{count} records in the {table} table match '{key}'")]
    Ambiguous {
        table: &'static str,
        key: String,
        count: usize,
    },

    #[error("Path '{path}' is not inside the cache directory '{root}'")]
    OutsideCache { path: Utf8PathBuf, root: Utf8PathBuf },

    #[error("Couldn't load cache table.\n{0}")]
    Table(#[from] CacheError),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Couldn't read table file.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't parse table.\n{0}")]
    Csv(#[from] csv::Error),

    #[error("Row {row} of the {table} table: {reason}")]
    Row {
        table: &'static str,
        row: usize,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Couldn't write to the local cache.\n{0}")]
    FileSystem(#[from] std::io::Error),

    #[error("Couldn't list objects in bucket '{bucket}'.\n{source}")]
    List {
        bucket: String,
        source: anyhow::Error,
    },

    #[error("Couldn't download '{key}' from bucket '{bucket}'.\n{source}")]
    Download {
        bucket: String,
        key: String,
        source: anyhow::Error,
    },
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error(transparent)]
    PathFormat(#[from] camino::FromPathBufError),

    #[error("No file matching '{0}' found")]
    FileNotFound(String),

    #[error("Couldn't read array '{path}'.\n{source}")]
    ReadArray {
        path: Utf8PathBuf,
        source: ndarray_npy::ReadNpyError,
    },

    #[error("Couldn't write array '{path}'.\n{source}")]
    WriteArray {
        path: Utf8PathBuf,
        source: ndarray_npy::WriteNpyError,
    },

    #[error("Camera log line {line}: {reason}")]
    CamLog { line: usize, reason: String },

    #[error("Sync arrays have mismatched lengths: {0}")]
    SyncShape(String),

    #[error("No Bpod event found in FPGA. No behaviour extraction. Check channel maps.")]
    SyncBpodFpga,

    #[error("Couldn't align clocks: {0}")]
    ClockAlignment(String),

    #[error("LED frame indices are not monotonically increasing")]
    NonMonotonicFrames,

    #[error("More frames than timestamps detected ({frames} frames, {leds} LED events)")]
    MoreFramesThanTimestamps { frames: usize, leds: usize },

    #[error("Timestamps and frames differ by more than 2 ({frames} frames, {leds} LED events)")]
    FrameCountMismatch { frames: usize, leds: usize },

    #[error("Step '{step}' failed.\n{source}")]
    Toolkit {
        step: &'static str,
        source: anyhow::Error,
    },

    #[error("Couldn't read video metadata for '{path}'.\n{source}")]
    Video {
        path: Utf8PathBuf,
        source: anyhow::Error,
    },
}
