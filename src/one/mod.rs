//! Experiment and dataset identifiers.
//!
//! An experiment can be named by its UUID (`eid`), the same UUID packed into
//! two integers, its session folder in the local cache, a remote URL, or a
//! reference string `yyyy-mm-dd_n_subject`. [`Converter`] maps between these
//! using the cached sessions and datasets tables.

pub mod alf;
mod cache;
mod convert;

pub use cache::{Cache, DatasetRecord, SessionRecord};
pub use convert::{Converter, Eid};
