//! Builder for constructing schema nodes.

use crate::core::{Child, Node, Restrictor, SchemaError};
use std::sync::Arc;

/// Builder for [`Node`] with a fluent API.
///
/// Validation is deferred to [`build`](NodeBuilder::build), which reports
/// the same errors as [`Node::new`].
#[derive(Debug)]
pub struct NodeBuilder {
    name: String,
    states: Vec<String>,
    children: Vec<Child>,
}

impl NodeBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            states: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Declare one state.
    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.states.push(state.into());
        self
    }

    /// Declare several states at once.
    pub fn states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.states.extend(states.into_iter().map(Into::into));
        self
    }

    /// Add a child available in every state.
    pub fn child(mut self, child: impl Into<Arc<Node>>) -> Self {
        self.children.push(Child::Always(child.into()));
        self
    }

    /// Add children available only in `states`.
    pub fn only<I, S, C, N>(mut self, states: I, children: C) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        C: IntoIterator<Item = N>,
        N: Into<Arc<Node>>,
    {
        self.children
            .push(Child::Only(Restrictor::new(states, children)));
        self
    }

    /// Build the node.
    /// Returns an error if the schema is inconsistent.
    pub fn build(self) -> Result<Node, SchemaError> {
        Node::new(self.name, self.states, self.children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assembles_restricted_children() {
        let light = NodeBuilder::new("light").states(["on", "off"]).build().unwrap();
        let door = NodeBuilder::new("door")
            .state("open")
            .state("closed")
            .only(["open"], [light])
            .build()
            .unwrap();

        assert_eq!(door.states().to_vec(), vec!["open", "closed"]);
        assert!(door.has_child("light", "open"));
        assert!(!door.has_child("light", "closed"));
    }

    #[test]
    fn builder_reports_schema_errors() {
        let lamp = Arc::new(NodeBuilder::new("lamp").state("on").build().unwrap());
        let result = NodeBuilder::new("room")
            .state("lit")
            .child(Arc::clone(&lamp))
            .child(lamp)
            .build();

        assert!(matches!(result, Err(SchemaError::DuplicateChild { .. })));
    }

    #[test]
    fn builder_without_states_only_has_wildcard() {
        let node = NodeBuilder::new("bare").build().unwrap();

        assert!(node.states().is_empty());
        assert!(node.has_state("*"));
        assert!(node.children("*").unwrap().is_empty());
    }
}
