//! PGO Profile Fetcher Library
//!
//! This library provides the building blocks behind the `pgofetch` binary:
//! catalog search and download, pprof decoding and merging, and the
//! concurrent acquisition pipeline that ties them together.

pub mod accumulator;
pub mod archive;
pub mod artifact;
pub mod catalog;
pub mod error;
pub mod noinline;
pub mod pipeline;
pub mod pprof;
pub mod query;
pub mod util;

pub use accumulator::{Accumulator, MergedProfile};
pub use catalog::{ApiClient, CandidateProfile, ProfileCatalog};
pub use error::{Error, Result};
pub use pipeline::AcquisitionPipeline;
pub use query::{build_queries, SelectionQuery};

/// Name used in logs and the HTTP user agent.
pub const NAME: &str = "pgofetch";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
