//! Schema nodes and state restrictors.
//!
//! A [`Node`] declares the states a machine may be in and the child machines
//! it owns. Children are either always available or, through a
//! [`Restrictor`], available only while the parent is in some of its states.

use super::error::SchemaError;
use std::collections::HashMap;
use std::sync::Arc;

/// Reserved state label meaning "any state".
pub const WILDCARD: &str = "*";

/// A child registration passed to [`Node::new`].
#[derive(Clone, Debug)]
pub enum Child {
    /// Child reachable in every state of the parent.
    Always(Arc<Node>),
    /// Children reachable only in the listed parent states.
    Only(Restrictor),
}

impl From<Node> for Child {
    fn from(node: Node) -> Self {
        Child::Always(Arc::new(node))
    }
}

impl From<Arc<Node>> for Child {
    fn from(node: Arc<Node>) -> Self {
        Child::Always(node)
    }
}

impl From<Restrictor> for Child {
    fn from(restrictor: Restrictor) -> Self {
        Child::Only(restrictor)
    }
}

/// Construction-time grouping that makes `children` reachable only while the
/// parent is in one of `states`.
///
/// A restrictor is consumed by [`Node::new`]; it is not part of the built
/// schema.
///
/// # Example
///
/// ```rust
/// use regent::core::{Node, Restrictor};
///
/// let light = Node::new("light", ["on", "off"], []).unwrap();
/// let door = Node::new(
///     "door",
///     ["open", "closed"],
///     [Restrictor::new(["open"], [light]).into()],
/// )
/// .unwrap();
///
/// assert!(door.has_child("light", "open"));
/// assert!(!door.has_child("light", "closed"));
/// ```
#[derive(Clone, Debug)]
pub struct Restrictor {
    states: Vec<String>,
    children: Vec<Arc<Node>>,
}

impl Restrictor {
    pub fn new<I, S, C, N>(states: I, children: C) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        C: IntoIterator<Item = N>,
        N: Into<Arc<Node>>,
    {
        Self {
            states: states.into_iter().map(Into::into).collect(),
            children: children.into_iter().map(Into::into).collect(),
        }
    }

    pub fn states(&self) -> &[String] {
        &self.states
    }

    pub fn children(&self) -> &[Arc<Node>] {
        &self.children
    }
}

/// Immutable description of one state machine in the tree.
///
/// Nodes are built bottom-up and never change afterwards. The same
/// `Arc<Node>` may be shared by several parents or several schemas.
///
/// # Example
///
/// ```rust
/// use regent::core::Node;
///
/// let lamp = Node::new("lamp", ["on", "off"], []).unwrap();
/// let room = Node::new("room", ["lit", "dark"], [lamp.into()]).unwrap();
///
/// assert!(room.has_state("lit"));
/// assert!(room.has_state("*"));
/// assert!(room.has_child("lamp", "dark"));
/// assert!(room.has_transition("lit", "*"));
/// ```
#[derive(Debug)]
pub struct Node {
    name: String,
    states: Vec<String>,
    shared: Vec<Arc<Node>>,
    restricted: HashMap<String, Vec<Arc<Node>>>,
}

impl Node {
    /// Build and validate a node.
    ///
    /// Fails when a state is declared twice, when `*` is declared as a
    /// state, when a restrictor references an undeclared state, or when two
    /// children with the same name would be reachable in the same state.
    pub fn new<N, I, S, C>(name: N, states: I, children: C) -> Result<Self, SchemaError>
    where
        N: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
        C: IntoIterator<Item = Child>,
    {
        let name = name.into();
        let mut declared: Vec<String> = Vec::new();
        for state in states {
            let state = state.into();
            if state == WILDCARD {
                return Err(SchemaError::ReservedState { parent: name });
            }
            if declared.contains(&state) {
                return Err(SchemaError::DuplicateState {
                    parent: name,
                    state,
                });
            }
            declared.push(state);
        }

        let mut node = Node {
            name,
            states: declared,
            shared: Vec::new(),
            restricted: HashMap::new(),
        };
        for child in children {
            node.register(child)?;
        }
        Ok(node)
    }

    fn register(&mut self, child: Child) -> Result<(), SchemaError> {
        match child {
            Child::Always(node) => self.register_shared(node),
            Child::Only(restrictor) => {
                for node in restrictor.children {
                    for state in &restrictor.states {
                        if state == WILDCARD {
                            self.register_shared(Arc::clone(&node))?;
                        } else {
                            self.register_restricted(state, Arc::clone(&node))?;
                        }
                    }
                }
                Ok(())
            }
        }
    }

    fn register_shared(&mut self, node: Arc<Node>) -> Result<(), SchemaError> {
        let taken = contains(&self.shared, &node.name)
            || self
                .restricted
                .values()
                .any(|bucket| contains(bucket, &node.name));
        if taken {
            return Err(self.duplicate(&node));
        }
        self.shared.push(node);
        Ok(())
    }

    fn register_restricted(&mut self, state: &str, node: Arc<Node>) -> Result<(), SchemaError> {
        if !self.states.iter().any(|s| s == state) {
            return Err(SchemaError::UnknownState {
                parent: self.name.clone(),
                state: state.to_string(),
            });
        }
        let taken = contains(&self.shared, &node.name)
            || self
                .restricted
                .get(state)
                .is_some_and(|bucket| contains(bucket, &node.name));
        if taken {
            return Err(self.duplicate(&node));
        }
        self.restricted
            .entry(state.to_string())
            .or_default()
            .push(node);
        Ok(())
    }

    fn duplicate(&self, node: &Node) -> SchemaError {
        SchemaError::DuplicateChild {
            parent: self.name.clone(),
            child: node.name.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared states, in declaration order. Never contains `*`.
    pub fn states(&self) -> &[String] {
        &self.states
    }

    /// True if `state` is declared or is the wildcard.
    pub fn has_state(&self, state: &str) -> bool {
        state == WILDCARD || self.states.iter().any(|s| s == state)
    }

    /// True if a child called `name` is reachable while in `state`.
    ///
    /// Always false for an invalid `state`.
    pub fn has_child(&self, name: &str, state: &str) -> bool {
        self.child(name, state).is_some()
    }

    /// True if both ends are declared states or the wildcard.
    pub fn has_transition(&self, from: &str, to: &str) -> bool {
        self.has_state(from) && self.has_state(to)
    }

    /// The child called `name` reachable while in `state`.
    ///
    /// State-specific registrations take precedence over `*` ones.
    pub fn child(&self, name: &str, state: &str) -> Option<&Arc<Node>> {
        if !self.has_state(state) {
            return None;
        }
        self.restricted
            .get(state)
            .and_then(|bucket| bucket.iter().find(|n| n.name == name))
            .or_else(|| self.shared.iter().find(|n| n.name == name))
    }

    /// Every child reachable while in `state`, or `None` if `state` is not
    /// valid for this node.
    ///
    /// Always-available children come first in registration order, followed
    /// by the children restricted to `state`. A state-specific child replaces
    /// an always-available child of the same name in place.
    pub fn children(&self, state: &str) -> Option<Vec<Arc<Node>>> {
        if !self.has_state(state) {
            return None;
        }
        let mut children: Vec<Arc<Node>> = self.shared.clone();
        if let Some(bucket) = self.restricted.get(state) {
            for node in bucket {
                match children.iter().position(|n| n.name == node.name) {
                    Some(index) => children[index] = Arc::clone(node),
                    None => children.push(Arc::clone(node)),
                }
            }
        }
        Some(children)
    }
}

fn contains(bucket: &[Arc<Node>], name: &str) -> bool {
    bucket.iter().any(|n| n.name == name)
}
