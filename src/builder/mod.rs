//! Builder API for ergonomic schema construction.
//!
//! This module provides a fluent [`NodeBuilder`] and two shorthands that
//! read like a schema declaration.

pub mod node;

pub use node::NodeBuilder;

use crate::core::{Child, Node, Restrictor, SchemaError};
use std::sync::Arc;

/// Create a node from its name, states and children.
///
/// # Example
///
/// ```
/// use regent::builder::{node, only};
///
/// let door = node(
///     "door",
///     ["open", "closed"],
///     [only(["open"], [node("light", ["on", "off"], []).unwrap()])],
/// )
/// .unwrap();
///
/// assert!(door.has_child("light", "open"));
/// ```
pub fn node<N, I, S, C>(name: N, states: I, children: C) -> Result<Node, SchemaError>
where
    N: Into<String>,
    I: IntoIterator<Item = S>,
    S: Into<String>,
    C: IntoIterator<Item = Child>,
{
    Node::new(name, states, children)
}

/// Scope `children` to the parent states listed in `states`.
///
/// # Example
///
/// ```
/// use regent::builder::{node, only};
///
/// let pump = node("pump", ["on", "off"], []).unwrap();
/// let tank = node("tank", ["full", "empty"], [only(["full"], [pump])]).unwrap();
///
/// assert!(!tank.has_child("pump", "empty"));
/// ```
pub fn only<I, S, C, N>(states: I, children: C) -> Child
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
    C: IntoIterator<Item = N>,
    N: Into<Arc<Node>>,
{
    Child::Only(Restrictor::new(states, children))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthand_matches_builder() {
        let by_hand = node(
            "door",
            ["open", "closed"],
            [only(["open"], [node("light", ["on"], []).unwrap()])],
        )
        .unwrap();
        let built = NodeBuilder::new("door")
            .states(["open", "closed"])
            .only(["open"], [node("light", ["on"], []).unwrap()])
            .build()
            .unwrap();

        for state in ["open", "closed", "*"] {
            assert_eq!(
                by_hand.has_child("light", state),
                built.has_child("light", state)
            );
        }
    }

    #[test]
    fn shorthand_mixes_shared_and_restricted() {
        let tank = node(
            "tank",
            ["full", "empty"],
            [
                node("gauge", ["low", "high"], []).unwrap().into(),
                only(["full"], [node("pump", ["on", "off"], []).unwrap()]),
            ],
        )
        .unwrap();

        assert!(tank.has_child("gauge", "empty"));
        assert!(tank.has_child("pump", "full"));
        assert!(!tank.has_child("pump", "empty"));
    }
}
