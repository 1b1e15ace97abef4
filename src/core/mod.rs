//! Static schema of a hierarchical state machine.
//!
//! This module contains the immutable description of the machine tree:
//! - [`Node`]: a named machine with its allowed states and children
//! - [`Restrictor`]: scopes a batch of children to a subset of parent states
//! - [`SchemaError`]: construction failures
//!
//! Nothing in this module has side effects. Schemas are validated once at
//! construction and shared afterwards as `Arc<Node>`; the runtime only ever
//! reads them.

mod error;
mod node;

pub use error::SchemaError;
pub use node::{Child, Node, Restrictor, WILDCARD};
