//! Machine facades.
//!
//! [`Hsm`] wraps a root context over a set of top-level nodes. [`Fsm`] is
//! an `Hsm` with a single flat node, addressed without naming it.

use super::config::{ConfigPatch, HsmConfig};
use super::context::{SharedConfig, StateContext};
use super::error::HsmError;
use super::guard::Guard;
use super::handler::Handler;
use crate::checkpoint::{Checkpoint, CheckpointError, Snapshot};
use crate::core::{Child, Node, SchemaError};
use serde_json::Value;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

/// Hierarchical state machine.
///
/// The root context sits in the wildcard state of a sentinel node whose
/// always-available children are the nodes given to [`Hsm::new`].
///
/// # Example
///
/// ```rust
/// use regent::core::Node;
/// use regent::runtime::Hsm;
///
/// let door = Node::new("door", ["open", "closed"], []).unwrap();
/// let hsm = Hsm::new([door]).unwrap();
///
/// hsm.context().tell("door", "open").unwrap();
///
/// let snapshot = hsm.snapshot();
/// assert_eq!(snapshot.pairs(), vec![("door".to_string(), "open".to_string())]);
/// ```
#[derive(Debug)]
pub struct Hsm {
    root: StateContext,
    config: SharedConfig,
}

impl Hsm {
    /// Name of the sentinel node at the root of every machine.
    pub const ROOT_NAME: &'static str = "__sentinel__";

    pub fn new<I, N>(nodes: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = N>,
        N: Into<Arc<Node>>,
    {
        Self::with_config(nodes, HsmConfig::default())
    }

    pub fn with_config<I, N>(nodes: I, config: HsmConfig) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = N>,
        N: Into<Arc<Node>>,
    {
        let sentinel = Node::new(
            Self::ROOT_NAME,
            Vec::<String>::new(),
            nodes.into_iter().map(|node| Child::Always(node.into())),
        )?;
        let config: SharedConfig = Rc::new(Cell::new(config));
        let root = StateContext::root(Arc::new(sentinel), Rc::clone(&config));
        Ok(Self { root, config })
    }

    pub fn context(&self) -> &StateContext {
        &self.root
    }

    pub fn config(&self) -> HsmConfig {
        self.config.get()
    }

    /// Merge `patch` into the machine configuration and hand it to every
    /// context of the tree, including subtrees that were configured
    /// separately.
    pub fn configure(&self, patch: impl Into<ConfigPatch>) {
        let config = self.config.get().merge(patch.into());
        self.config.set(config);
        self.root.self_configure(Rc::clone(&self.config));
        debug!(
            debug = config.debug,
            require_handler = config.require_handler,
            "machine configured"
        );
    }

    pub fn update(&self, delta: f64) -> Result<(), HsmError> {
        self.root.update(delta)
    }

    /// Rebuild the tree from `snapshot`. The name and state of the top
    /// entry are ignored; its children are restored under the root.
    pub fn restore(&self, snapshot: &Snapshot) -> Result<(), HsmError> {
        self.root.restore(snapshot)
    }

    pub fn snapshot(&self) -> Snapshot {
        self.root.snapshot()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        let checkpoint = Checkpoint::new(self.snapshot());
        debug!(id = %checkpoint.id, "checkpoint taken");
        checkpoint
    }

    /// Restore from a checkpoint taken by [`Hsm::checkpoint`].
    pub fn resume(&self, checkpoint: &Checkpoint) -> Result<(), HsmError> {
        checkpoint.validate()?;
        if checkpoint.root.name != Self::ROOT_NAME {
            return Err(CheckpointError::ForeignRoot {
                found: checkpoint.root.name.clone(),
                expected: Self::ROOT_NAME.to_string(),
            }
            .into());
        }
        debug!(id = %checkpoint.id, "resuming checkpoint");
        self.restore(&checkpoint.root)
    }
}

/// Flat state machine over a single node.
///
/// # Example
///
/// ```rust
/// use regent::runtime::{EnterOutcome, Fsm, Handler, StateContext};
///
/// let fsm = Fsm::new(["idle", "busy"]).unwrap();
/// fsm.when("busy", Handler::enter(|ctx: &StateContext| {
///     ctx.set("idle").unwrap();
///     EnterOutcome::None
/// }))
/// .unwrap();
///
/// fsm.set("busy").unwrap();
/// assert_eq!(fsm.state().as_deref(), Some("idle"));
/// ```
#[derive(Debug)]
pub struct Fsm {
    hsm: Hsm,
}

impl Fsm {
    /// Name of the single node driven by an `Fsm`.
    pub const ROOT_NAME: &'static str = "__fsm__";

    pub fn new<I, S>(states: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let node = Node::new(Self::ROOT_NAME, states, [])?;
        Ok(Self {
            hsm: Hsm::new([node])?,
        })
    }

    /// Build a machine whose states are the keys of `handlers`.
    pub fn with_handlers<I, S>(handlers: I) -> Result<Self, HsmError>
    where
        I: IntoIterator<Item = (S, Handler<StateContext>)>,
        S: Into<String>,
    {
        let handlers: Vec<(String, Handler<StateContext>)> = handlers
            .into_iter()
            .map(|(state, handler)| (state.into(), handler))
            .collect();
        let fsm = Self::new(handlers.iter().map(|(state, _)| state.clone()))?;
        for (state, handler) in handlers {
            fsm.when(&state, handler)?;
        }
        Ok(fsm)
    }

    pub fn set(&self, state: &str) -> Result<(), HsmError> {
        self.set_with(state, Value::Null)
    }

    pub fn set_with(&self, state: &str, data: Value) -> Result<(), HsmError> {
        self.hsm.context().tell_with(Self::ROOT_NAME, state, data)
    }

    /// Exit the current state without entering another.
    pub fn stop(&self) -> Result<(), HsmError> {
        self.hsm.context().stop(Self::ROOT_NAME)
    }

    pub fn when(&self, state: &str, handler: Handler<StateContext>) -> Result<&Self, HsmError> {
        self.hsm.context().when(Self::ROOT_NAME, state, handler)?;
        Ok(self)
    }

    pub fn when_transition(
        &self,
        from: &str,
        to: &str,
        handler: Handler<Guard>,
    ) -> Result<&Self, HsmError> {
        self.hsm
            .context()
            .when_transition(Self::ROOT_NAME, from, to, handler)?;
        Ok(self)
    }

    pub fn update(&self, delta: f64) -> Result<(), HsmError> {
        self.hsm.update(delta)
    }

    pub fn configure(&self, patch: impl Into<ConfigPatch>) -> &Self {
        self.hsm.configure(patch);
        self
    }

    /// Current state, or `None` before the first `set`.
    pub fn state(&self) -> Option<String> {
        self.hsm.context().state_of(Self::ROOT_NAME)
    }

    /// Context of the current state, unless a guard is pending.
    pub fn context(&self) -> Option<StateContext> {
        self.hsm.context().child(Self::ROOT_NAME)
    }

    pub fn hsm(&self) -> &Hsm {
        &self.hsm
    }
}
