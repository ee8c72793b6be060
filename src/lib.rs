#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
mod error;
pub mod fetch;
pub mod one;
pub mod pipeline;
pub mod widefield;

pub use crate::config::{AWS_ROOT_PATH, BPOD_CHANNEL, HTTP_DATA_SERVER, Params};
pub use crate::error::*;
pub use crate::fetch::{FetchReport, Fetcher, LocalBucket, ObjectStore};
pub use crate::one::{Cache, Converter, DatasetRecord, Eid, SessionRecord};
pub use crate::pipeline::{AcquisitionDescription, Pipeline, TaskKind, TaskNode, make_pipeline};
pub use crate::widefield::Widefield;

/// Install a `tracing` subscriber printing to stderr.
///
/// The filter is read from `RUST_LOG` and defaults to `info`. Calling this
/// more than once is harmless.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
