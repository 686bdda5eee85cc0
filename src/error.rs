//! Error types for configuration and watcher setup.

use thiserror::Error;

/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, TriggerError>;

/// Errors raised while loading configuration or building the watch pipeline.
///
/// Delivery failures are not part of this enum: they never escape the
/// scheduler and are reported as [`crate::scheduler::DeliveryFailure`].
#[derive(Error, Debug)]
pub enum TriggerError {
    /// A rule pattern is not a valid glob.
    #[error("invalid watch pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: glob::PatternError,
    },

    /// A configuration value is out of range.
    #[error("configuration error: {0}")]
    Config(String),

    /// The workspace `.gitignore` could not be parsed.
    #[error("gitignore error: {0}")]
    Gitignore(#[from] ignore::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML.
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
