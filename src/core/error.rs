//! Schema construction errors.

use thiserror::Error;

/// Errors raised while building a [`Node`](super::Node) tree.
///
/// A schema that fails to build never reaches the runtime, so every variant
/// points at a mistake in the static description of the machine.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Duplicate node: `{child}` is already reachable under `{parent}`")]
    DuplicateChild { parent: String, child: String },

    #[error("Node `{parent}` declares state `{state}` more than once")]
    DuplicateState { parent: String, state: String },

    #[error("Node `{parent}` cannot declare the reserved wildcard state `*`")]
    ReservedState { parent: String },

    #[error("Node `{parent}` restricts children to undeclared state `{state}`")]
    UnknownState { parent: String, state: String },
}
