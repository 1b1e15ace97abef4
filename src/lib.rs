//! Regent: a hierarchical state machine runtime
//!
//! Regent separates an immutable schema from the live contexts that run it.
//! A schema is a tree of [`Node`]s, each with a set of states and children
//! that may be scoped to some of those states. At runtime every active
//! node is a [`StateContext`] that owns the contexts of its active children
//! and drives their transitions through a small per-child command queue.
//!
//! # Core Concepts
//!
//! - **Node**: name, allowed states and children; validated on construction
//! - **StateContext**: one live instance per active (node, state) pair
//! - **Handler**: enter/update/exit callbacks attached to a child state
//! - **Guard**: suspends a transition until it is explicitly resolved
//! - **Snapshot**: structural image of the active tree, for restore
//!
//! # Example
//!
//! ```rust
//! use regent::{EnterOutcome, Handler, Hsm, Node, Restrictor, StateContext};
//!
//! let light = Node::new("light", ["on", "off"], []).unwrap();
//! let door = Node::new(
//!     "door",
//!     ["open", "closed"],
//!     [Restrictor::new(["open"], [light]).into()],
//! )
//! .unwrap();
//!
//! let hsm = Hsm::new([door]).unwrap();
//! hsm.context()
//!     .when("door", "open", Handler::enter(|door: &StateContext| {
//!         door.tell("light", "on").unwrap();
//!         EnterOutcome::None
//!     }))
//!     .unwrap();
//!
//! hsm.context().tell("door", "open").unwrap();
//! assert_eq!(
//!     hsm.snapshot().pairs(),
//!     vec![
//!         ("door".to_string(), "open".to_string()),
//!         ("light".to_string(), "on".to_string()),
//!     ]
//! );
//!
//! hsm.context().tell("door", "closed").unwrap();
//! assert_eq!(hsm.snapshot().pairs(), vec![("door".to_string(), "closed".to_string())]);
//! ```

pub mod builder;
pub mod checkpoint;
pub mod core;
pub mod runtime;

// Re-export commonly used types
pub use checkpoint::{Checkpoint, Snapshot};
pub use core::{Child, Node, Restrictor, SchemaError};
pub use runtime::{
    EnterOutcome, Fsm, Guard, Handler, Hsm, HsmConfig, HsmError, MachineState, PartialHandler,
    StateContext,
};
