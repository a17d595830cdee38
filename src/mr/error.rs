use std::io;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, MrError>;

/// Failure kinds of the engine. Task-level errors abort the task that hit
/// them; the master never re-issues a failed task.
#[derive(Debug, thiserror::Error)]
pub enum MrError {
    /// Bad arguments or an impossible job setup. Fatal before any work runs.
    #[error("configuration error: {0}")]
    Config(String),

    /// A transfer of an intermediate file did not complete.
    #[error("fetch of {url} failed: {reason}")]
    FetchFailed { url: String, reason: String },

    /// An intermediate relation could not be created or opened.
    #[error("store at {path} unavailable: {source}")]
    StoreUnavailable {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// An intermediate relation failed mid-iteration or mid-write.
    #[error("store at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// The user's Map or Reduce function returned an error.
    #[error("user function failed: {0}")]
    User(anyhow::Error),

    /// The master could not be reached; the worker terminates on this.
    #[error("cannot reach the master: {0}")]
    Rpc(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
