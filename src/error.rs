//! Crate-wide error types.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid flags, arguments, or missing environment configuration.
    /// Always a hard failure, regardless of `--fail`.
    #[error("config error: {0}")]
    Config(String),

    #[error("search profiles: {0}")]
    Search(String),

    #[error("download profile: {0}")]
    Download(String),

    #[error("profile bundle: {0}")]
    Archive(String),

    #[error("profile codec: {0}")]
    Codec(String),

    #[error("profile merge: {0}")]
    Merge(String),

    /// Every query completed and none of them produced a profile. An empty
    /// merged profile has no serialized form, so this surfaces as an error.
    #[error("no profiles found for any query")]
    NoProfiles,

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded after {0:?}")]
    Timeout(Duration),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
