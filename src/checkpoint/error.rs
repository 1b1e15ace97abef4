//! Checkpoint failures.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to encode checkpoint: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode checkpoint: {0}")]
    Decode(#[source] serde_json::Error),

    /// Written by a different checkpoint format version.
    #[error("checkpoint version {found} is not supported (expected {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    /// Taken from a machine with a different root entry.
    #[error("checkpoint root `{found}` does not match machine root `{expected}`")]
    ForeignRoot { found: String, expected: String },
}
