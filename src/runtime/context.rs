//! Live state contexts.
//!
//! A [`StateContext`] is the runtime instance of one node in one state. It
//! owns the contexts of its active children, the handlers and guards
//! registered for them, and one command queue per child. Contexts are
//! created on enter and become [`MachineState::Dead`] on exit.
//!
//! Callbacks are always cloned out of the context before they run, so a
//! handler may call back into any context of the tree (including its own)
//! without tripping a `RefCell` borrow.

use super::command::{Command, CommandQueue};
use super::config::HsmConfig;
use super::error::HsmError;
use super::guard::{Guard, GuardContext, PARENT_ORIGIN, SELF_ORIGIN};
use super::handler::Handler;
use crate::checkpoint::Snapshot;
use crate::core::{Node, WILDCARD};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{info, trace, warn};

/// Configuration shared by reference down a context tree.
pub(crate) type SharedConfig = Rc<Cell<HsmConfig>>;

/// Per-context reentrancy tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MachineState {
    Idle,
    Enter,
    Exit,
    Update,
    Restore,
    /// Frozen while a guard decides the transition away from this context.
    Guard,
    Dead,
}

/// What currently occupies a child slot.
#[derive(Clone)]
pub(crate) enum Active {
    State(StateContext),
    Guard(GuardContext),
}

impl Active {
    fn into_state(self) -> Option<StateContext> {
        match self {
            Active::State(context) => Some(context),
            Active::Guard(_) => None,
        }
    }
}

struct ChildSlot {
    node: Arc<Node>,
    state: Option<String>,
    active: Option<Active>,
    handlers: HashMap<String, Handler<StateContext>>,
    guards: HashMap<String, HashMap<String, Handler<Guard>>>,
    queue: CommandQueue,
    draining: bool,
}

impl ChildSlot {
    fn new(node: Arc<Node>) -> Self {
        Self {
            node,
            state: None,
            active: None,
            handlers: HashMap::new(),
            guards: HashMap::new(),
            queue: CommandQueue::default(),
            draining: false,
        }
    }

    fn awaiting_guard(&self) -> bool {
        matches!(self.active, Some(Active::Guard(_)))
    }

    fn handler_for(&self, state: &str) -> Option<&Handler<StateContext>> {
        self.handlers
            .get(state)
            .or_else(|| self.handlers.get(WILDCARD))
    }

    // Exact match first, then (from, *), (*, to), (*, *).
    fn guard_for(&self, from: Option<&str>, to: Option<&str>) -> Option<&Handler<Guard>> {
        [from, Some(WILDCARD)]
            .into_iter()
            .flatten()
            .filter_map(|from| self.guards.get(from))
            .find_map(|targets| {
                [to, Some(WILDCARD)]
                    .into_iter()
                    .flatten()
                    .find_map(|to| targets.get(to))
            })
    }
}

struct Inner {
    node: Arc<Node>,
    state: String,
    data: Value,
    parent: Weak<RefCell<Inner>>,
    depth: usize,
    config: SharedConfig,
    machine_state: MachineState,
    handler: Option<Handler<StateContext>>,
    children: Vec<ChildSlot>,
}

impl Inner {
    fn name(&self) -> String {
        self.node.name().to_string()
    }

    fn unknown(&self, name: &str) -> HsmError {
        HsmError::UnknownTarget {
            name: name.to_string(),
            scope: self.name(),
            state: self.state.clone(),
        }
    }

    fn slot(&self, name: &str) -> Result<&ChildSlot, HsmError> {
        self.children
            .iter()
            .find(|slot| slot.node.name() == name)
            .ok_or_else(|| self.unknown(name))
    }

    fn slot_mut(&mut self, name: &str) -> Result<&mut ChildSlot, HsmError> {
        match self.children.iter().position(|slot| slot.node.name() == name) {
            Some(index) => Ok(&mut self.children[index]),
            None => Err(self.unknown(name)),
        }
    }

    fn slot_names(&self) -> Vec<String> {
        self.children
            .iter()
            .map(|slot| slot.node.name().to_string())
            .collect()
    }

    fn active_names(&self) -> Vec<String> {
        self.children
            .iter()
            .filter(|slot| slot.active.is_some())
            .map(|slot| slot.node.name().to_string())
            .collect()
    }
}

/// Runtime instance of a node in one state.
///
/// `StateContext` is a cheap handle; clones refer to the same context.
/// Handlers receive it on enter and update and may keep it to drive
/// transitions later. Once the context has exited, every scheduling call on
/// it fails with [`HsmError::DeadContext`].
///
/// # Example
///
/// ```rust
/// use regent::core::{Node, Restrictor};
/// use regent::runtime::{EnterOutcome, Handler, Hsm, StateContext};
///
/// let light = Node::new("light", ["on", "off"], []).unwrap();
/// let door = Node::new("door", ["open", "closed"], [Restrictor::new(["open"], [light]).into()]).unwrap();
/// let hsm = Hsm::new([door]).unwrap();
///
/// hsm.context()
///     .when("door", "open", Handler::enter(|door: &StateContext| {
///         door.tell("light", "on").unwrap();
///         EnterOutcome::None
///     }))
///     .unwrap();
/// hsm.context().tell("door", "open").unwrap();
///
/// let door = hsm.context().child("door").unwrap();
/// assert_eq!(door.state_of("light").as_deref(), Some("on"));
/// ```
#[derive(Clone)]
pub struct StateContext {
    inner: Rc<RefCell<Inner>>,
}

/// Non-owning handle used for back-references to a context.
#[derive(Clone)]
pub(crate) struct WeakContext(Weak<RefCell<Inner>>);

impl WeakContext {
    pub(crate) fn upgrade(&self) -> Option<StateContext> {
        self.0.upgrade().map(|inner| StateContext { inner })
    }
}

impl StateContext {
    pub(crate) fn root(node: Arc<Node>, config: SharedConfig) -> Self {
        Self::build(
            node,
            Weak::new(),
            0,
            WILDCARD.to_string(),
            None,
            Value::Null,
            config,
        )
    }

    fn build(
        node: Arc<Node>,
        parent: Weak<RefCell<Inner>>,
        depth: usize,
        state: String,
        handler: Option<Handler<StateContext>>,
        data: Value,
        config: SharedConfig,
    ) -> Self {
        let children = node
            .children(&state)
            .unwrap_or_default()
            .into_iter()
            .map(ChildSlot::new)
            .collect();
        Self {
            inner: Rc::new(RefCell::new(Inner {
                node,
                state,
                data,
                parent,
                depth,
                config,
                machine_state: MachineState::Idle,
                handler,
                children,
            })),
        }
    }

    fn spawn(
        &self,
        node: Arc<Node>,
        state: String,
        handler: Option<Handler<StateContext>>,
        data: Value,
    ) -> StateContext {
        let (depth, config) = {
            let inner = self.inner.borrow();
            (inner.depth + 1, Rc::clone(&inner.config))
        };
        Self::build(
            node,
            Rc::downgrade(&self.inner),
            depth,
            state,
            handler,
            data,
            config,
        )
    }

    pub(crate) fn downgrade(&self) -> WeakContext {
        WeakContext(Rc::downgrade(&self.inner))
    }

    pub fn name(&self) -> String {
        self.inner.borrow().name()
    }

    pub fn node(&self) -> Arc<Node> {
        Arc::clone(&self.inner.borrow().node)
    }

    pub fn state(&self) -> String {
        self.inner.borrow().state.clone()
    }

    /// Payload passed with the transition that created this context.
    pub fn data(&self) -> Value {
        self.inner.borrow().data.clone()
    }

    pub fn depth(&self) -> usize {
        self.inner.borrow().depth
    }

    pub fn machine_state(&self) -> MachineState {
        self.inner.borrow().machine_state
    }

    pub fn is_dead(&self) -> bool {
        self.machine_state() == MachineState::Dead
    }

    pub fn config(&self) -> HsmConfig {
        self.inner.borrow().config.get()
    }

    pub fn parent(&self) -> Option<StateContext> {
        self.inner
            .borrow()
            .parent
            .upgrade()
            .map(|inner| StateContext { inner })
    }

    /// True if both handles point at the same context.
    pub fn ptr_eq(&self, other: &StateContext) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Recorded state of a direct child.
    ///
    /// While a guard is pending this is still the state being left.
    pub fn state_of(&self, name: &str) -> Option<String> {
        self.inner
            .borrow()
            .slot(name)
            .ok()
            .and_then(|slot| slot.state.clone())
    }

    /// Active context of a direct child, if it is not waiting on a guard.
    pub fn child(&self, name: &str) -> Option<StateContext> {
        self.inner
            .borrow()
            .slot(name)
            .ok()
            .and_then(|slot| slot.active.clone())
            .and_then(Active::into_state)
    }

    /// True while a guard is deciding a transition of child `name`.
    pub fn is_guarded(&self, name: &str) -> bool {
        self.inner
            .borrow()
            .slot(name)
            .is_ok_and(ChildSlot::awaiting_guard)
    }

    /// Target states of the commands waiting in the queue of child `name`.
    /// Exit-only commands show up as `None`.
    pub fn queued_states(&self, name: &str) -> Vec<Option<String>> {
        self.inner
            .borrow()
            .slot(name)
            .map(|slot| {
                slot.queue
                    .iter()
                    .map(|command| command.to_state.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Structural image of this context and its active descendants.
    ///
    /// A child waiting on a guard is reported through its frozen context.
    pub fn snapshot(&self) -> Snapshot {
        let (snapshot, children) = {
            let inner = self.inner.borrow();
            let children: Vec<StateContext> = inner
                .children
                .iter()
                .filter_map(|slot| match &slot.active {
                    Some(Active::State(context)) => Some(context.clone()),
                    Some(Active::Guard(stand_in)) => stand_in.guard().previous(),
                    None => None,
                })
                .collect();
            let snapshot =
                Snapshot::new(inner.node.name(), inner.state.clone()).with_data(inner.data.clone());
            (snapshot, children)
        };
        Snapshot {
            children: children.iter().map(StateContext::snapshot).collect(),
            ..snapshot
        }
    }

    // ---- public operations ----

    /// Register the handler run when child `name` enters `state`.
    ///
    /// A handler registered for `*` is used for states without their own,
    /// and counts as a handler when `require_handler` is enabled.
    pub fn when(
        &self,
        name: &str,
        state: &str,
        handler: Handler<StateContext>,
    ) -> Result<&Self, HsmError> {
        self.ensure_alive()?;
        let mut inner = self.inner.borrow_mut();
        let slot = inner.slot_mut(name)?;
        if !slot.node.has_state(state) {
            return Err(HsmError::InvalidState {
                name: name.to_string(),
                state: state.to_string(),
            });
        }
        slot.handlers.insert(state.to_string(), handler);
        Ok(self)
    }

    /// Register a guard for transitions of child `name` from `from` to `to`.
    /// Either end may be `*`.
    pub fn when_transition(
        &self,
        name: &str,
        from: &str,
        to: &str,
        handler: Handler<Guard>,
    ) -> Result<&Self, HsmError> {
        self.ensure_alive()?;
        let mut inner = self.inner.borrow_mut();
        let slot = inner.slot_mut(name)?;
        if !slot.node.has_transition(from, to) {
            return Err(HsmError::InvalidTransition {
                name: name.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        slot.guards
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string(), handler);
        Ok(self)
    }

    /// Move direct child `name` to `state`.
    pub fn tell(&self, name: &str, state: &str) -> Result<(), HsmError> {
        self.tell_with(name, state, Value::Null)
    }

    pub fn tell_with(&self, name: &str, state: &str, data: Value) -> Result<(), HsmError> {
        if !self.admit()? {
            return Ok(());
        }
        self.schedule(self.node(), name, Some(state), data)
    }

    /// Exit direct child `name` without entering another state.
    pub fn stop(&self, name: &str) -> Result<(), HsmError> {
        if !self.admit()? {
            return Ok(());
        }
        self.schedule(self.node(), name, None, Value::Null)
    }

    /// Move sibling `name` to `state`.
    pub fn ask(&self, name: &str, state: &str) -> Result<(), HsmError> {
        self.ask_with(name, state, Value::Null)
    }

    pub fn ask_with(&self, name: &str, state: &str, data: Value) -> Result<(), HsmError> {
        if !self.admit()? {
            return Ok(());
        }
        let parent = self.parent_or_err()?;
        parent.schedule(self.node(), name, Some(state), data)
    }

    /// Move this context's own node to `state`.
    pub fn set(&self, state: &str) -> Result<(), HsmError> {
        self.set_with(state, Value::Null)
    }

    pub fn set_with(&self, state: &str, data: Value) -> Result<(), HsmError> {
        if !self.admit()? {
            return Ok(());
        }
        let parent = self.parent_or_err()?;
        parent.schedule(self.node(), &self.name(), Some(state), data)
    }

    /// Tick active children depth-first, then this context's own handler.
    pub fn update(&self, delta: f64) -> Result<(), HsmError> {
        if !self.lifecycle_gate()? {
            return Ok(());
        }
        self.self_update(delta)
    }

    /// Point this subtree at its own copy of `config`.
    pub fn configure(&self, config: HsmConfig) -> Result<(), HsmError> {
        match self.machine_state() {
            MachineState::Dead => Err(self.dead()),
            MachineState::Restore => Ok(()),
            _ => {
                self.self_configure(Rc::new(Cell::new(config)));
                Ok(())
            }
        }
    }

    /// Rebuild the children of this context from `snapshot`.
    ///
    /// Enter handlers run so they can reinstall update and exit callbacks;
    /// guards do not run, and transitions requested while restoring are
    /// ignored.
    pub fn restore(&self, snapshot: &Snapshot) -> Result<(), HsmError> {
        if !self.lifecycle_gate()? {
            return Ok(());
        }
        self.self_restore(snapshot)
    }

    fn dead(&self) -> HsmError {
        HsmError::DeadContext { name: self.name() }
    }

    fn ensure_alive(&self) -> Result<(), HsmError> {
        if self.is_dead() {
            return Err(self.dead());
        }
        Ok(())
    }

    // Ok(false) means "ignore silently".
    fn admit(&self) -> Result<bool, HsmError> {
        match self.machine_state() {
            MachineState::Dead => Err(self.dead()),
            MachineState::Restore => Ok(false),
            MachineState::Guard => Err(HsmError::Frozen { name: self.name() }),
            _ => Ok(true),
        }
    }

    fn lifecycle_gate(&self) -> Result<bool, HsmError> {
        match self.machine_state() {
            MachineState::Idle => Ok(true),
            MachineState::Restore => Ok(false),
            MachineState::Dead => Err(self.dead()),
            MachineState::Guard => Err(HsmError::Frozen { name: self.name() }),
            state => Err(HsmError::Reentrant {
                name: self.name(),
                state,
            }),
        }
    }

    fn parent_or_err(&self) -> Result<StateContext, HsmError> {
        self.parent()
            .ok_or_else(|| HsmError::NoParent { name: self.name() })
    }

    // ---- lifecycle ----

    pub(crate) fn set_tag(&self, tag: MachineState) {
        self.inner.borrow_mut().machine_state = tag;
    }

    fn settle(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.machine_state != MachineState::Dead {
            inner.machine_state = MachineState::Idle;
        }
    }

    fn run_enter(&self) {
        let enter = self.inner.borrow().handler.as_ref().and_then(Handler::enter_fn);
        if let Some(enter) = enter {
            let outcome = enter(self);
            if let Some(handler) = self.inner.borrow_mut().handler.as_mut() {
                handler.install(outcome);
            }
        }
    }

    pub(crate) fn self_enter(&self) {
        self.set_tag(MachineState::Enter);
        self.run_enter();
        self.settle();
    }

    pub(crate) fn self_exit(&self) {
        let names = {
            let mut inner = self.inner.borrow_mut();
            if inner.machine_state == MachineState::Dead {
                return;
            }
            inner.machine_state = MachineState::Exit;
            inner.active_names()
        };
        for name in names {
            self.exec_exit(&name);
        }
        let handler = self.inner.borrow_mut().handler.take();
        if let Some(exit) = handler.as_ref().and_then(Handler::exit_fn) {
            exit();
        }
        self.set_tag(MachineState::Dead);
    }

    pub(crate) fn self_update(&self, delta: f64) -> Result<(), HsmError> {
        let names = {
            let mut inner = self.inner.borrow_mut();
            inner.machine_state = MachineState::Update;
            inner.slot_names()
        };
        let result = names
            .iter()
            .try_for_each(|name| self.exec_update(name, delta));
        if result.is_ok() {
            let update = self.inner.borrow().handler.as_ref().and_then(Handler::update_fn);
            if let Some(update) = update {
                update(self, delta);
            }
        }
        self.settle();
        result?;
        self.flush()
    }

    // Run commands queued during the tick for slots it had already passed.
    fn flush(&self) -> Result<(), HsmError> {
        let pending: Vec<String> = {
            let inner = self.inner.borrow();
            if inner.machine_state == MachineState::Dead {
                return Ok(());
            }
            inner
                .children
                .iter()
                .filter(|slot| !slot.queue.is_empty())
                .map(|slot| slot.node.name().to_string())
                .collect()
        };
        pending.iter().try_for_each(|name| self.run(name))
    }

    pub(crate) fn self_restore(&self, snapshot: &Snapshot) -> Result<(), HsmError> {
        self.set_tag(MachineState::Restore);
        self.run_enter();
        let result = snapshot
            .children
            .iter()
            .try_for_each(|child| self.exec_restore(child));
        self.settle();
        result
    }

    pub(crate) fn self_configure(&self, config: SharedConfig) {
        let children: Vec<StateContext> = {
            let mut inner = self.inner.borrow_mut();
            inner.config = Rc::clone(&config);
            inner
                .children
                .iter()
                .filter_map(|slot| slot.active.clone().and_then(Active::into_state))
                .collect()
        };
        for child in children {
            child.self_configure(Rc::clone(&config));
        }
    }

    // ---- scheduling ----

    fn schedule(
        &self,
        source: Arc<Node>,
        name: &str,
        to_state: Option<&str>,
        data: Value,
    ) -> Result<(), HsmError> {
        let run_now = {
            let mut inner = self.inner.borrow_mut();
            match inner.machine_state {
                MachineState::Dead => return Err(HsmError::DeadContext { name: inner.name() }),
                MachineState::Guard => return Err(HsmError::Frozen { name: inner.name() }),
                _ => {}
            }
            let updating = inner.machine_state == MachineState::Update;
            let slot = inner.slot_mut(name)?;
            match to_state {
                Some(state) if state == WILDCARD || !slot.node.has_state(state) => {
                    return Err(HsmError::InvalidState {
                        name: name.to_string(),
                        state: state.to_string(),
                    });
                }
                None if slot.state.is_none() => return Ok(()),
                _ => {}
            }
            let command = Command {
                source,
                target: Arc::clone(&slot.node),
                from_state: slot.state.clone(),
                to_state: to_state.map(str::to_string),
                data,
                approved: false,
            };
            trace!(
                node = name,
                from = ?command.from_state,
                to = ?command.to_state,
                "scheduling transition"
            );
            slot.queue.push(command);
            !updating && !slot.draining
        };
        if run_now {
            self.run(name)?;
        }
        Ok(())
    }

    fn run(&self, name: &str) -> Result<(), HsmError> {
        {
            let mut inner = self.inner.borrow_mut();
            let slot = inner.slot_mut(name)?;
            if slot.draining {
                return Ok(());
            }
            slot.draining = true;
        }
        let result = self.drain(name);
        if let Ok(slot) = self.inner.borrow_mut().slot_mut(name) {
            slot.draining = false;
        }
        result
    }

    fn drain(&self, name: &str) -> Result<(), HsmError> {
        loop {
            let command = {
                let inner = self.inner.borrow();
                let slot = inner.slot(name)?;
                if slot.awaiting_guard() {
                    return Ok(());
                }
                match slot.queue.front() {
                    Some(command) => command.clone(),
                    None => return Ok(()),
                }
            };
            let result = self.exec_command(name, command);
            if let Ok(slot) = self.inner.borrow_mut().slot_mut(name) {
                slot.queue.pop_front();
                if result.is_err() {
                    slot.queue.clear();
                }
            }
            result?;
        }
    }

    fn exec_command(&self, name: &str, command: Command) -> Result<(), HsmError> {
        let guard = {
            let inner = self.inner.borrow();
            let slot = inner.slot(name)?;
            if slot.state != command.from_state {
                warn!(
                    node = name,
                    expected = ?command.from_state,
                    actual = ?slot.state,
                    "dropping stale command"
                );
                return Err(HsmError::StaleCommand {
                    name: name.to_string(),
                    expected: command.from_state,
                    actual: slot.state.clone(),
                });
            }
            if command.approved {
                None
            } else {
                slot.guard_for(command.from_state.as_deref(), command.to_state.as_deref())
                    .cloned()
            }
        };
        match guard {
            Some(handler) => self.exec_guard(name, command, handler),
            None => self.exec_transition(name, &command),
        }
    }

    fn exec_transition(&self, name: &str, command: &Command) -> Result<(), HsmError> {
        if command.from_state.is_some() {
            self.exec_exit(name);
        }
        match &command.to_state {
            Some(state) => self.exec_enter(name, state, command.data.clone()),
            None => Ok(()),
        }
    }

    fn instantiate(&self, name: &str, state: &str, data: Value) -> Result<StateContext, HsmError> {
        let (node, handler, config) = {
            let inner = self.inner.borrow();
            let slot = inner.slot(name)?;
            (
                Arc::clone(&slot.node),
                slot.handler_for(state).cloned(),
                inner.config.get(),
            )
        };
        if handler.is_none() && config.require_handler {
            return Err(HsmError::MissingHandler {
                name: name.to_string(),
                state: state.to_string(),
            });
        }
        let context = self.spawn(node, state.to_string(), handler, data);
        let mut inner = self.inner.borrow_mut();
        let slot = inner.slot_mut(name)?;
        slot.state = Some(state.to_string());
        slot.active = Some(Active::State(context.clone()));
        Ok(context)
    }

    fn exec_enter(&self, name: &str, state: &str, data: Value) -> Result<(), HsmError> {
        let context = self.instantiate(name, state, data)?;
        if context.config().debug {
            let indent = "    ".repeat(self.depth());
            info!("{indent}{name} => {state}");
        }
        trace!(node = name, state, "entering state");
        context.self_enter();
        Ok(())
    }

    fn exec_exit(&self, name: &str) {
        let active = match self.inner.borrow_mut().slot_mut(name) {
            Ok(slot) => {
                slot.state = None;
                slot.active.take()
            }
            Err(_) => None,
        };
        match active {
            Some(Active::State(context)) => {
                trace!(node = name, state = %context.state(), "exiting state");
                context.self_exit();
            }
            Some(Active::Guard(stand_in)) => {
                trace!(node = name, "abandoning pending guard");
                stand_in.abandon();
            }
            None => {}
        }
    }

    fn exec_update(&self, name: &str, delta: f64) -> Result<(), HsmError> {
        let active = self
            .inner
            .borrow()
            .slot(name)
            .ok()
            .and_then(|slot| slot.active.clone());
        match active {
            Some(Active::State(context)) => context.self_update(delta)?,
            Some(Active::Guard(stand_in)) => stand_in.self_update(delta),
            None => {}
        }
        let pending = self
            .inner
            .borrow()
            .slot(name)
            .is_ok_and(|slot| !slot.queue.is_empty());
        if pending {
            self.run(name)?;
        }
        Ok(())
    }

    fn exec_restore(&self, snapshot: &Snapshot) -> Result<(), HsmError> {
        let live = {
            let inner = self.inner.borrow();
            let slot = inner.slot(&snapshot.name)?;
            if snapshot.state == WILDCARD || !slot.node.has_state(&snapshot.state) {
                return Err(HsmError::InvalidState {
                    name: snapshot.name.clone(),
                    state: snapshot.state.clone(),
                });
            }
            slot.active.is_some()
        };
        if live {
            self.exec_exit(&snapshot.name);
        }
        trace!(node = %snapshot.name, state = %snapshot.state, "restoring state");
        let context = self.instantiate(&snapshot.name, &snapshot.state, snapshot.data.clone())?;
        context.self_restore(snapshot)
    }

    // ---- guards ----

    fn exec_guard(
        &self,
        name: &str,
        command: Command,
        handler: Handler<Guard>,
    ) -> Result<(), HsmError> {
        let origin = if Arc::ptr_eq(&command.source, &command.target) {
            SELF_ORIGIN.to_string()
        } else if Arc::ptr_eq(&command.source, &self.node()) {
            PARENT_ORIGIN.to_string()
        } else {
            command.source.name().to_string()
        };
        let previous = {
            let mut inner = self.inner.borrow_mut();
            let slot = inner.slot_mut(name)?;
            slot.active.take().and_then(Active::into_state)
        };
        if let Some(context) = &previous {
            context.set_tag(MachineState::Guard);
        }
        trace!(
            node = name,
            origin = %origin,
            from = ?command.from_state,
            to = ?command.to_state,
            "transition suspended by guard"
        );
        let stand_in = GuardContext::new(Guard::new(origin, name, self.downgrade(), command, previous), handler);
        self.inner.borrow_mut().slot_mut(name)?.active = Some(Active::Guard(stand_in.clone()));
        stand_in.self_enter()
    }

    /// Finish a guarded transition of child `name`.
    ///
    /// When the guard is resolved from inside the drain loop of that child,
    /// the loop owns the queue head and the transition runs directly.
    /// Otherwise it goes back to the head of the queue, already approved.
    pub(crate) fn resolve_guard(
        &self,
        name: &str,
        previous: Option<StateContext>,
        command: Command,
        proceed: bool,
    ) -> Result<(), HsmError> {
        if let Some(context) = &previous {
            context.set_tag(MachineState::Idle);
        }
        let (stand_in, draining) = {
            let mut inner = self.inner.borrow_mut();
            let slot = inner.slot_mut(name)?;
            let stand_in = std::mem::replace(&mut slot.active, previous.map(Active::State));
            (stand_in, slot.draining)
        };
        if let Some(Active::Guard(stand_in)) = stand_in {
            stand_in.self_exit();
        }
        trace!(node = name, proceed, "guard resolved");
        if !proceed {
            return if draining { Ok(()) } else { self.run(name) };
        }
        if draining {
            self.exec_transition(name, &command)
        } else {
            self.inner
                .borrow_mut()
                .slot_mut(name)?
                .queue
                .push_front(command.approve());
            self.run(name)
        }
    }
}

impl fmt::Debug for StateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("StateContext")
                .field("node", &inner.node.name())
                .field("state", &inner.state)
                .field("depth", &inner.depth)
                .field("machine_state", &inner.machine_state)
                .finish(),
            Err(_) => f.write_str("StateContext { .. }"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Restrictor;
    use crate::runtime::{ConfigPatch, EnterOutcome, Fsm, Hsm, PartialHandler};
    use serde_json::json;

    type Journal = Rc<RefCell<Vec<String>>>;

    fn journal() -> Journal {
        Rc::new(RefCell::new(Vec::new()))
    }

    fn record(journal: &Journal, entry: impl Into<String>) {
        journal.borrow_mut().push(entry.into());
    }

    fn leaf(name: &str) -> Node {
        Node::new(name, ["on", "off"], []).unwrap()
    }

    fn house() -> Hsm {
        let lamp = leaf("lamp");
        let room = Node::new("room", ["lit", "dark"], [lamp.into()]).unwrap();
        Hsm::new([room]).unwrap()
    }

    #[test]
    fn tell_enters_child_with_data() {
        let hsm = house();
        let seen = journal();
        let log = Rc::clone(&seen);
        hsm.context()
            .when(
                "room",
                "lit",
                Handler::enter(move |room: &StateContext| {
                    record(&log, room.data()["by"].as_str().unwrap_or_default());
                    EnterOutcome::None
                }),
            )
            .unwrap();

        hsm.context().tell_with("room", "lit", json!({"by": "switch"})).unwrap();

        let room = hsm.context().child("room").unwrap();
        assert_eq!(hsm.context().state_of("room").as_deref(), Some("lit"));
        assert_eq!(room.state(), "lit");
        assert_eq!(room.depth(), 1);
        assert!(room.parent().unwrap().ptr_eq(hsm.context()));
        assert_eq!(*seen.borrow(), vec!["switch"]);
    }

    #[test]
    fn exit_cascades_to_children_first() {
        let hsm = house();
        let seen = journal();
        let log = Rc::clone(&seen);
        hsm.context()
            .when(
                "room",
                "lit",
                Handler::enter(move |room: &StateContext| {
                    let lamp_log = Rc::clone(&log);
                    room.when(
                        "lamp",
                        "on",
                        Handler::new().on_exit(move || record(&lamp_log, "lamp exit")),
                    )
                    .unwrap();
                    room.tell("lamp", "on").unwrap();
                    let room_log = Rc::clone(&log);
                    EnterOutcome::exit(move || record(&room_log, "room exit"))
                }),
            )
            .unwrap();

        hsm.context().tell("room", "lit").unwrap();
        let room = hsm.context().child("room").unwrap();
        let lamp = room.child("lamp").unwrap();
        hsm.context().tell("room", "dark").unwrap();

        assert_eq!(*seen.borrow(), vec!["lamp exit", "room exit"]);
        assert!(room.is_dead());
        assert!(lamp.is_dead());
        assert_eq!(lamp.depth(), 2);
        assert!(hsm.context().child("room").unwrap().state_of("lamp").is_none());
    }

    #[test]
    fn enter_outcome_only_lasts_one_activation() {
        let fsm = Fsm::new(["idle", "busy"]).unwrap();
        let seen = journal();
        let first = Rc::new(Cell::new(true));
        let log = Rc::clone(&seen);
        let registered = Rc::clone(&seen);
        fsm.when(
            "busy",
            Handler::new()
                .on_enter(move |_: &StateContext| {
                    if first.replace(false) {
                        let log = Rc::clone(&log);
                        EnterOutcome::Partial(
                            PartialHandler::new().on_exit(move || record(&log, "override exit")),
                        )
                    } else {
                        EnterOutcome::None
                    }
                })
                .on_exit(move || record(&registered, "registered exit")),
        )
        .unwrap();

        for state in ["busy", "idle", "busy", "idle"] {
            fsm.set(state).unwrap();
        }

        assert_eq!(*seen.borrow(), vec!["override exit", "registered exit"]);
    }

    #[test]
    fn update_ticks_children_before_parent() {
        let left = leaf("left");
        let right = leaf("right");
        let pair = Node::new("pair", ["running"], [left.into(), right.into()]).unwrap();
        let hsm = Hsm::new([pair]).unwrap();
        let seen = journal();

        let log = Rc::clone(&seen);
        hsm.context()
            .when(
                "pair",
                "running",
                Handler::new()
                    .on_enter(move |pair: &StateContext| {
                        for name in ["left", "right"] {
                            let log = Rc::clone(&log);
                            pair.when(
                                name,
                                "on",
                                Handler::new().on_update(move |ctx: &StateContext, _| {
                                    record(&log, ctx.name())
                                }),
                            )
                            .unwrap();
                            pair.tell(name, "on").unwrap();
                        }
                        EnterOutcome::None
                    })
                    .on_update({
                        let log = Rc::clone(&seen);
                        move |pair: &StateContext, _| record(&log, pair.name())
                    }),
            )
            .unwrap();

        hsm.context().tell("pair", "running").unwrap();
        hsm.update(0.1).unwrap();

        assert_eq!(*seen.borrow(), vec!["left", "right", "pair"]);
    }

    #[test]
    fn transitions_requested_during_update_wait_for_the_tick() {
        let fsm = Fsm::new(["a", "b", "c", "d"]).unwrap();
        let queued = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&queued);
        fsm.when(
            "a",
            Handler::new().on_update(move |ctx: &StateContext, _| {
                for state in ["b", "c", "d"] {
                    ctx.set(state).unwrap();
                }
                let parent = ctx.parent().unwrap();
                *seen.borrow_mut() = parent.queued_states(&ctx.name());
                assert_eq!(ctx.state(), "a");
            }),
        )
        .unwrap();
        fsm.set("a").unwrap();

        let err = fsm.update(1.0).unwrap_err();

        assert_eq!(
            *queued.borrow(),
            vec![Some("b".to_string()), Some("d".to_string())]
        );
        assert!(matches!(
            err,
            HsmError::StaleCommand { ref expected, ref actual, .. }
                if expected.as_deref() == Some("a") && actual.as_deref() == Some("b")
        ));
        assert_eq!(fsm.state().as_deref(), Some("b"));
        assert!(fsm.hsm().context().queued_states(Fsm::ROOT_NAME).is_empty());
    }

    #[test]
    fn failed_drain_discards_the_rest_of_the_batch() {
        let fsm = Fsm::new(["a", "unhandled", "c"]).unwrap();
        fsm.configure(ConfigPatch::new().with_require_handler(true));
        fsm.when(
            "a",
            Handler::new().on_update(|ctx: &StateContext, _| {
                ctx.set("unhandled").unwrap();
                ctx.set("c").unwrap();
            }),
        )
        .unwrap();
        fsm.when("c", Handler::new()).unwrap();
        fsm.set("a").unwrap();

        let err = fsm.update(1.0).unwrap_err();

        assert!(matches!(err, HsmError::MissingHandler { ref state, .. } if state == "unhandled"));
        assert!(fsm.hsm().context().queued_states(Fsm::ROOT_NAME).is_empty());

        fsm.set("c").unwrap();

        assert_eq!(fsm.state().as_deref(), Some("c"));
        assert!(fsm.hsm().context().queued_states(Fsm::ROOT_NAME).is_empty());
    }

    #[test]
    fn requests_for_inactive_children_run_at_the_tick() {
        let hsm = Hsm::new([leaf("first"), leaf("second"), leaf("third")]).unwrap();
        hsm.context()
            .when(
                "second",
                "on",
                Handler::new().on_update(|second: &StateContext, _| {
                    second.ask("first", "on").unwrap();
                    second.ask("third", "off").unwrap();
                }),
            )
            .unwrap();
        hsm.context().tell("second", "on").unwrap();

        hsm.update(0.1).unwrap();

        let root = hsm.context();
        assert_eq!(root.state_of("first").as_deref(), Some("on"));
        assert_eq!(root.state_of("third").as_deref(), Some("off"));
        assert!(root.queued_states("first").is_empty());
    }

    #[test]
    fn set_from_enter_runs_after_current_command() {
        let fsm = Fsm::new(["booting", "ready"]).unwrap();
        let seen = journal();
        let log = Rc::clone(&seen);
        fsm.when(
            "booting",
            Handler::enter(move |ctx: &StateContext| {
                ctx.set("ready").unwrap();
                record(&log, format!("booting entered, still {}", ctx.state()));
                EnterOutcome::None
            }),
        )
        .unwrap();

        fsm.set("booting").unwrap();

        assert_eq!(fsm.state().as_deref(), Some("ready"));
        assert_eq!(*seen.borrow(), vec!["booting entered, still booting"]);
    }

    #[test]
    fn ask_moves_a_sibling() {
        let hsm = Hsm::new([leaf("left"), leaf("right")]).unwrap();
        hsm.context()
            .when(
                "left",
                "on",
                Handler::enter(|left: &StateContext| {
                    left.ask("right", "off").unwrap();
                    EnterOutcome::None
                }),
            )
            .unwrap();

        hsm.context().tell("left", "on").unwrap();

        assert_eq!(hsm.context().state_of("right").as_deref(), Some("off"));
    }

    #[test]
    fn stop_exits_without_entering() {
        let hsm = Hsm::new([leaf("lamp")]).unwrap();
        let seen = journal();
        let log = Rc::clone(&seen);
        hsm.context()
            .when("lamp", "on", Handler::new().on_exit(move || record(&log, "off")))
            .unwrap();

        hsm.context().stop("lamp").unwrap();
        hsm.context().tell("lamp", "on").unwrap();
        hsm.context().stop("lamp").unwrap();

        assert!(hsm.context().state_of("lamp").is_none());
        assert!(hsm.context().child("lamp").is_none());
        assert_eq!(*seen.borrow(), vec!["off"]);
    }

    #[test]
    fn scheduling_is_validated_against_the_schema() {
        let hsm = Hsm::new([leaf("lamp")]).unwrap();
        let root = hsm.context();

        assert!(matches!(root.tell("fan", "on"), Err(HsmError::UnknownTarget { .. })));
        assert!(matches!(root.tell("lamp", "dim"), Err(HsmError::InvalidState { .. })));
        assert!(matches!(root.tell("lamp", WILDCARD), Err(HsmError::InvalidState { .. })));
        assert!(matches!(
            root.when("lamp", "dim", Handler::new()),
            Err(HsmError::InvalidState { .. })
        ));
        assert!(matches!(
            root.when_transition("lamp", "on", "dim", Handler::new()),
            Err(HsmError::InvalidTransition { .. })
        ));
        assert!(matches!(root.ask("lamp", "on"), Err(HsmError::NoParent { .. })));
        assert!(root.when_transition("lamp", WILDCARD, "off", Handler::new()).is_ok());
    }

    #[test]
    fn missing_handler_fails_when_required() {
        let hsm = Hsm::new([leaf("lamp")]).unwrap();
        hsm.configure(ConfigPatch::new().with_require_handler(true));

        let err = hsm.context().tell("lamp", "on").unwrap_err();

        assert!(matches!(err, HsmError::MissingHandler { ref state, .. } if state == "on"));
        assert!(hsm.context().state_of("lamp").is_none());
    }

    #[test]
    fn wildcard_handler_covers_unregistered_states() {
        let hsm = Hsm::new([leaf("lamp")]).unwrap();
        hsm.configure(ConfigPatch::new().with_require_handler(true));
        let seen = journal();
        let log = Rc::clone(&seen);
        hsm.context()
            .when(
                "lamp",
                WILDCARD,
                Handler::enter(move |lamp: &StateContext| {
                    record(&log, lamp.state());
                    EnterOutcome::None
                }),
            )
            .unwrap();

        hsm.context().tell("lamp", "on").unwrap();
        hsm.context().tell("lamp", "off").unwrap();

        assert_eq!(*seen.borrow(), vec!["on", "off"]);
    }

    #[test]
    fn dead_context_rejects_calls() {
        let fsm = Fsm::new(["a", "b"]).unwrap();
        fsm.set("a").unwrap();
        let stale = fsm.context().unwrap();
        fsm.set("b").unwrap();

        assert!(stale.is_dead());
        assert!(matches!(stale.set("a"), Err(HsmError::DeadContext { .. })));
        assert!(matches!(stale.update(0.1), Err(HsmError::DeadContext { .. })));
        assert!(matches!(
            stale.configure(HsmConfig::default()),
            Err(HsmError::DeadContext { .. })
        ));
        assert!(matches!(
            stale.restore(&Snapshot::new(Fsm::ROOT_NAME, "a")),
            Err(HsmError::DeadContext { .. })
        ));
    }

    #[test]
    fn reentrant_update_is_rejected() {
        let fsm = Fsm::new(["spinning"]).unwrap();
        let outcome = Rc::new(RefCell::new(None));
        let slot = Rc::clone(&outcome);
        fsm.when(
            "spinning",
            Handler::new().on_update(move |ctx: &StateContext, delta| {
                *slot.borrow_mut() = Some(ctx.update(delta));
            }),
        )
        .unwrap();
        fsm.set("spinning").unwrap();

        fsm.update(0.5).unwrap();

        let inner = outcome.borrow_mut().take().unwrap();
        assert!(matches!(
            inner,
            Err(HsmError::Reentrant {
                state: MachineState::Update,
                ..
            })
        ));
    }

    #[test]
    fn restore_ignores_transitions_and_reruns_enter() {
        let fsm = Fsm::new(["a", "b"]).unwrap();
        let seen = journal();
        let log = Rc::clone(&seen);
        fsm.when(
            "a",
            Handler::enter(move |ctx: &StateContext| {
                record(&log, format!("enter a ({:?})", ctx.machine_state()));
                ctx.set("b").unwrap();
                EnterOutcome::None
            }),
        )
        .unwrap();

        let snapshot = Snapshot::new(Hsm::ROOT_NAME, WILDCARD)
            .with_child(Snapshot::new(Fsm::ROOT_NAME, "a").with_data(json!(7)));
        fsm.hsm().restore(&snapshot).unwrap();

        assert_eq!(fsm.state().as_deref(), Some("a"));
        assert_eq!(fsm.context().unwrap().data(), json!(7));
        assert_eq!(fsm.context().unwrap().machine_state(), MachineState::Idle);
        assert_eq!(*seen.borrow(), vec!["enter a (Restore)"]);
    }

    #[test]
    fn restore_replaces_live_children() {
        let fsm = Fsm::new(["a", "b"]).unwrap();
        let seen = journal();
        let log = Rc::clone(&seen);
        fsm.when("a", Handler::new().on_exit(move || record(&log, "a exit")))
            .unwrap();
        fsm.set("a").unwrap();

        let snapshot = Snapshot::new(Hsm::ROOT_NAME, WILDCARD).with_child(Snapshot::new(Fsm::ROOT_NAME, "b"));
        fsm.hsm().restore(&snapshot).unwrap();

        assert_eq!(fsm.state().as_deref(), Some("b"));
        assert_eq!(*seen.borrow(), vec!["a exit"]);
    }

    #[test]
    fn restore_rejects_snapshots_outside_the_schema() {
        let hsm = house();

        let unknown = Snapshot::new(Hsm::ROOT_NAME, WILDCARD).with_child(Snapshot::new("attic", "lit"));
        let invalid = Snapshot::new(Hsm::ROOT_NAME, WILDCARD).with_child(Snapshot::new("room", "dim"));

        assert!(matches!(hsm.restore(&unknown), Err(HsmError::UnknownTarget { .. })));
        assert!(matches!(hsm.restore(&invalid), Err(HsmError::InvalidState { .. })));
    }

    #[test]
    fn configure_shares_one_reference_per_subtree() {
        let light = leaf("light");
        let door = Node::new("door", ["open"], [Restrictor::new(["open"], [light]).into()]).unwrap();
        let hsm = Hsm::new([door]).unwrap();
        hsm.context().tell("door", "open").unwrap();
        let door = hsm.context().child("door").unwrap();
        door.tell("light", "on").unwrap();

        hsm.configure(ConfigPatch::new().with_debug(true));
        assert!(door.child("light").unwrap().config().debug);

        door.configure(HsmConfig {
            debug: false,
            require_handler: true,
        })
        .unwrap();

        assert!(door.child("light").unwrap().config().require_handler);
        assert!(!hsm.context().config().require_handler);
        assert!(hsm.context().config().debug);
    }

    #[test]
    fn snapshot_mirrors_active_tree() {
        let hsm = house();
        hsm.context()
            .when(
                "room",
                "lit",
                Handler::enter(|room: &StateContext| {
                    room.tell_with("lamp", "on", json!({"watts": 40})).unwrap();
                    EnterOutcome::None
                }),
            )
            .unwrap();
        hsm.context().tell("room", "lit").unwrap();

        let snapshot = hsm.context().snapshot();

        assert_eq!(snapshot.name, Hsm::ROOT_NAME);
        assert_eq!(snapshot.state, WILDCARD);
        assert_eq!(
            snapshot.pairs(),
            vec![
                ("room".to_string(), "lit".to_string()),
                ("lamp".to_string(), "on".to_string()),
            ]
        );
        assert_eq!(snapshot.children[0].children[0].data, json!({"watts": 40}));
    }
}
