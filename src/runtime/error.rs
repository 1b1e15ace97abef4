//! Runtime error types.

use super::context::MachineState;
use crate::checkpoint::CheckpointError;
use crate::core::SchemaError;
use thiserror::Error;

/// Errors raised while driving a machine.
///
/// None of these are retried internally; they abort the operation in
/// progress and surface to the caller.
#[derive(Debug, Error)]
pub enum HsmError {
    #[error("Name doesn't exist in `{scope}` state `{state}`: {name}")]
    UnknownTarget {
        name: String,
        scope: String,
        state: String,
    },

    #[error("`{name}` doesn't have state: {state}")]
    InvalidState { name: String, state: String },

    #[error("`{name}` doesn't have transition: {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: String,
        to: String,
    },

    #[error("No handler registered for `{name}`: enter {state}")]
    MissingHandler { name: String, state: String },

    #[error("State of `{name}` is inconsistent: expected {expected:?}, found {actual:?}")]
    StaleCommand {
        name: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    #[error("Context `{name}` was called after it has exited")]
    DeadContext { name: String },

    #[error("Context `{name}` is busy ({state:?}) and cannot be re-entered")]
    Reentrant { name: String, state: MachineState },

    #[error("Context `{name}` is frozen while a guard decides its transition")]
    Frozen { name: String },

    #[error("Guard for `{target}` was already resolved")]
    GuardResolved { target: String },

    #[error("Context `{name}` has no parent scope")]
    NoParent { name: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}
