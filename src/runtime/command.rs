//! Transition commands and the per-child collapsing queue.

use crate::core::Node;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

/// A scheduled request to move `target` from `from_state` to `to_state`.
///
/// `from_state` is `None` for a first activation, `to_state` is `None` for
/// an exit-only command.
#[derive(Clone, Debug)]
pub(crate) struct Command {
    pub source: Arc<Node>,
    pub target: Arc<Node>,
    pub from_state: Option<String>,
    pub to_state: Option<String>,
    pub data: Value,
    /// Set once a guard let this command through.
    pub approved: bool,
}

impl Command {
    pub fn approve(mut self) -> Self {
        self.approved = true;
        self
    }
}

/// Bounded queue holding the in-flight command and at most one pending one.
///
/// The head is never displaced; every push beyond the second slot replaces
/// the pending command with the newest request.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    commands: VecDeque<Command>,
}

impl CommandQueue {
    /// Enqueue `command`. Returns true if the queue was empty.
    pub fn push(&mut self, command: Command) -> bool {
        let was_empty = self.commands.is_empty();
        if self.commands.len() >= 2 {
            if let Some(pending) = self.commands.back_mut() {
                *pending = command;
            }
        } else {
            self.commands.push_back(command);
        }
        was_empty
    }

    /// Put an already-approved command ahead of everything else.
    pub fn push_front(&mut self, command: Command) {
        self.commands.push_front(command);
    }

    pub fn front(&self) -> Option<&Command> {
        self.commands.front()
    }

    pub fn pop_front(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    /// Drop every queued command.
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }
}
