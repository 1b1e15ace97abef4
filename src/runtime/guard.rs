//! Transition guards.
//!
//! A guard registered with [`StateContext::when_transition`] suspends a
//! matching transition. While suspended, the context being left is frozen
//! and a stand-in occupies its slot; the stand-in runs the guard handler's
//! enter/update/exit callbacks with a [`Guard`] as subject. The transition
//! happens once [`Guard::proceed`] is called, or is dropped on
//! [`Guard::cancel`].

use super::command::Command;
use super::context::{MachineState, StateContext, WeakContext};
use super::error::HsmError;
use super::handler::Handler;
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Origin label of a transition a node requested for itself.
pub const SELF_ORIGIN: &str = "__self__";

/// Origin label of a transition requested by the enclosing context.
pub const PARENT_ORIGIN: &str = "__parent__";

struct Pending {
    command: Command,
    previous: Option<StateContext>,
}

struct GuardState {
    origin: String,
    target: String,
    from_state: Option<String>,
    to_state: Option<String>,
    data: Value,
    owner: WeakContext,
    pending: RefCell<Option<Pending>>,
}

/// Handle to a suspended transition.
///
/// Clones share the same pending transition. Exactly one of
/// [`proceed`](Guard::proceed) or [`cancel`](Guard::cancel) takes effect;
/// later calls fail with [`HsmError::GuardResolved`]. A guard whose
/// enclosing context exits before it is resolved is abandoned and behaves
/// as resolved.
///
/// # Example
///
/// ```rust
/// use regent::runtime::{EnterOutcome, Fsm, Guard, Handler};
/// use std::cell::RefCell;
/// use std::rc::Rc;
///
/// let fsm = Fsm::new(["editing", "saved"]).unwrap();
/// let parked: Rc<RefCell<Option<Guard>>> = Rc::default();
/// let slot = Rc::clone(&parked);
/// fsm.when_transition("editing", "saved", Handler::enter(move |guard: &Guard| {
///     *slot.borrow_mut() = Some(guard.clone());
///     EnterOutcome::None
/// }))
/// .unwrap();
///
/// fsm.set("editing").unwrap();
/// fsm.set("saved").unwrap();
/// assert_eq!(fsm.state().as_deref(), Some("editing"));
///
/// let guard = parked.borrow_mut().take().unwrap();
/// guard.proceed().unwrap();
/// assert_eq!(fsm.state().as_deref(), Some("saved"));
/// ```
#[derive(Clone)]
pub struct Guard {
    state: Rc<GuardState>,
}

impl Guard {
    pub(crate) fn new(
        origin: String,
        target: &str,
        owner: WeakContext,
        command: Command,
        previous: Option<StateContext>,
    ) -> Self {
        Self {
            state: Rc::new(GuardState {
                origin,
                target: target.to_string(),
                from_state: command.from_state.clone(),
                to_state: command.to_state.clone(),
                data: command.data.clone(),
                owner,
                pending: RefCell::new(Some(Pending { command, previous })),
            }),
        }
    }

    /// Who requested the transition: [`SELF_ORIGIN`], [`PARENT_ORIGIN`] or
    /// the name of the sibling that asked.
    pub fn origin(&self) -> &str {
        &self.state.origin
    }

    /// Name of the node being transitioned.
    pub fn target(&self) -> &str {
        &self.state.target
    }

    pub fn from_state(&self) -> Option<&str> {
        self.state.from_state.as_deref()
    }

    pub fn to_state(&self) -> Option<&str> {
        self.state.to_state.as_deref()
    }

    pub fn data(&self) -> &Value {
        &self.state.data
    }

    pub fn is_resolved(&self) -> bool {
        self.state.pending.borrow().is_none()
    }

    /// Let the transition through.
    pub fn proceed(&self) -> Result<(), HsmError> {
        self.resolve(true)
    }

    /// Drop the transition and unfreeze the current state.
    pub fn cancel(&self) -> Result<(), HsmError> {
        self.resolve(false)
    }

    fn resolve(&self, proceed: bool) -> Result<(), HsmError> {
        let pending = self
            .state
            .pending
            .borrow_mut()
            .take()
            .ok_or_else(|| HsmError::GuardResolved {
                target: self.state.target.clone(),
            })?;
        let owner = self
            .state
            .owner
            .upgrade()
            .ok_or_else(|| HsmError::DeadContext {
                name: self.state.target.clone(),
            })?;
        owner.resolve_guard(&self.state.target, pending.previous, pending.command, proceed)
    }

    /// Give up on the transition, handing back the frozen context.
    pub(crate) fn abandon(&self) -> Option<StateContext> {
        self.state
            .pending
            .borrow_mut()
            .take()
            .and_then(|pending| pending.previous)
    }

    /// The frozen context, while the guard is pending.
    pub(crate) fn previous(&self) -> Option<StateContext> {
        self.state
            .pending
            .borrow()
            .as_ref()
            .and_then(|pending| pending.previous.clone())
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("origin", &self.state.origin)
            .field("target", &self.state.target)
            .field("from_state", &self.state.from_state)
            .field("to_state", &self.state.to_state)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

struct StandIn {
    guard: Guard,
    handler: Option<Handler<Guard>>,
    machine_state: MachineState,
}

/// Occupies a child slot while its guard is pending.
#[derive(Clone)]
pub(crate) struct GuardContext {
    inner: Rc<RefCell<StandIn>>,
}

impl GuardContext {
    pub(crate) fn new(guard: Guard, handler: Handler<Guard>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StandIn {
                guard,
                handler: Some(handler),
                machine_state: MachineState::Idle,
            })),
        }
    }

    pub(crate) fn guard(&self) -> Guard {
        self.inner.borrow().guard.clone()
    }

    fn settle(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.machine_state != MachineState::Dead {
            inner.machine_state = MachineState::Idle;
        }
    }

    /// Run the guard's enter callback. A [`Proceed`](super::EnterOutcome::Proceed)
    /// outcome resolves the guard on the spot.
    pub(crate) fn self_enter(&self) -> Result<(), HsmError> {
        let (enter, guard) = {
            let mut inner = self.inner.borrow_mut();
            inner.machine_state = MachineState::Enter;
            (
                inner.handler.as_ref().and_then(Handler::enter_fn),
                inner.guard.clone(),
            )
        };
        let mut proceed = false;
        if let Some(enter) = enter {
            let outcome = enter(&guard);
            if let Some(handler) = self.inner.borrow_mut().handler.as_mut() {
                proceed = handler.install(outcome);
            }
        }
        self.settle();
        if proceed && !guard.is_resolved() {
            guard.proceed()?;
        }
        Ok(())
    }

    pub(crate) fn self_update(&self, delta: f64) {
        let (update, guard) = {
            let mut inner = self.inner.borrow_mut();
            inner.machine_state = MachineState::Update;
            (
                inner.handler.as_ref().and_then(Handler::update_fn),
                inner.guard.clone(),
            )
        };
        if let Some(update) = update {
            update(&guard, delta);
        }
        self.settle();
    }

    pub(crate) fn self_exit(&self) {
        let handler = {
            let mut inner = self.inner.borrow_mut();
            if inner.machine_state == MachineState::Dead {
                return;
            }
            inner.machine_state = MachineState::Exit;
            inner.handler.take()
        };
        if let Some(exit) = handler.as_ref().and_then(Handler::exit_fn) {
            exit();
        }
        self.inner.borrow_mut().machine_state = MachineState::Dead;
    }

    /// Tear down an unresolved guard: the stand-in exits first, then the
    /// frozen context it was guarding.
    pub(crate) fn abandon(&self) {
        let previous = self.guard().abandon();
        self.self_exit();
        if let Some(previous) = previous {
            previous.self_exit();
        }
    }
}
