//! Lifecycle handlers and enter outcomes.
//!
//! A [`Handler`] bundles the enter/update/exit callbacks of one state (or of
//! one guard). The subject type `C` is [`StateContext`](super::StateContext)
//! for state handlers and [`Guard`](super::Guard) for guard handlers.

use std::fmt;
use std::rc::Rc;

/// Enter callback. Its return value decides what happens next.
pub type EnterFn<C> = Rc<dyn Fn(&C) -> EnterOutcome<C>>;

/// Update callback, invoked once per tick with the elapsed delta.
pub type UpdateFn<C> = Rc<dyn Fn(&C, f64)>;

/// Exit callback.
pub type ExitFn = Rc<dyn Fn()>;

/// What an enter callback asks the runtime to do.
pub enum EnterOutcome<C> {
    /// Keep the registered update and exit callbacks.
    None,
    /// Let a guarded transition through immediately. Ignored for states.
    Proceed,
    /// Replace both update and exit callbacks for this activation.
    Partial(PartialHandler<C>),
    /// Replace the exit callback for this activation.
    Exit(ExitFn),
}

impl<C> EnterOutcome<C> {
    /// Install `exit` as the exit callback of this activation.
    pub fn exit<F>(exit: F) -> Self
    where
        F: Fn() + 'static,
    {
        EnterOutcome::Exit(Rc::new(exit))
    }
}

impl<C> Default for EnterOutcome<C> {
    fn default() -> Self {
        EnterOutcome::None
    }
}

impl<C> From<PartialHandler<C>> for EnterOutcome<C> {
    fn from(partial: PartialHandler<C>) -> Self {
        EnterOutcome::Partial(partial)
    }
}

impl<C> fmt::Debug for EnterOutcome<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnterOutcome::None => f.write_str("None"),
            EnterOutcome::Proceed => f.write_str("Proceed"),
            EnterOutcome::Partial(partial) => f.debug_tuple("Partial").field(partial).finish(),
            EnterOutcome::Exit(_) => f.write_str("Exit(..)"),
        }
    }
}

/// Update/exit pair returned from an enter callback.
pub struct PartialHandler<C> {
    update: Option<UpdateFn<C>>,
    exit: Option<ExitFn>,
}

impl<C> PartialHandler<C> {
    pub fn new() -> Self {
        Self {
            update: None,
            exit: None,
        }
    }

    pub fn on_update<F>(mut self, update: F) -> Self
    where
        F: Fn(&C, f64) + 'static,
    {
        self.update = Some(Rc::new(update));
        self
    }

    pub fn on_exit<F>(mut self, exit: F) -> Self
    where
        F: Fn() + 'static,
    {
        self.exit = Some(Rc::new(exit));
        self
    }
}

impl<C> Default for PartialHandler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for PartialHandler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialHandler")
            .field("update", &self.update.is_some())
            .field("exit", &self.exit.is_some())
            .finish()
    }
}

/// Enter/update/exit callbacks registered for a state or a guard.
///
/// Handlers are cheap to clone; the runtime clones the registered handler
/// for every activation so that an [`EnterOutcome`] only affects the
/// activation that produced it.
///
/// # Example
///
/// ```rust
/// use regent::runtime::{EnterOutcome, Fsm, Handler};
/// use std::cell::Cell;
/// use std::rc::Rc;
///
/// let ticks = Rc::new(Cell::new(0.0));
/// let seen = Rc::clone(&ticks);
///
/// let fsm = Fsm::new(["idle", "running"]).unwrap();
/// fsm.when(
///     "running",
///     Handler::new()
///         .on_enter(|_| EnterOutcome::None)
///         .on_update(move |_, delta| seen.set(seen.get() + delta)),
/// )
/// .unwrap();
///
/// fsm.set("running").unwrap();
/// fsm.update(0.5).unwrap();
/// assert_eq!(ticks.get(), 0.5);
/// ```
pub struct Handler<C> {
    enter: Option<EnterFn<C>>,
    update: Option<UpdateFn<C>>,
    exit: Option<ExitFn>,
}

impl<C> Handler<C> {
    pub fn new() -> Self {
        Self {
            enter: None,
            update: None,
            exit: None,
        }
    }

    /// Handler with only an enter callback.
    pub fn enter<F>(enter: F) -> Self
    where
        F: Fn(&C) -> EnterOutcome<C> + 'static,
    {
        Self::new().on_enter(enter)
    }

    pub fn on_enter<F>(mut self, enter: F) -> Self
    where
        F: Fn(&C) -> EnterOutcome<C> + 'static,
    {
        self.enter = Some(Rc::new(enter));
        self
    }

    pub fn on_update<F>(mut self, update: F) -> Self
    where
        F: Fn(&C, f64) + 'static,
    {
        self.update = Some(Rc::new(update));
        self
    }

    pub fn on_exit<F>(mut self, exit: F) -> Self
    where
        F: Fn() + 'static,
    {
        self.exit = Some(Rc::new(exit));
        self
    }

    pub(crate) fn enter_fn(&self) -> Option<EnterFn<C>> {
        self.enter.clone()
    }

    pub(crate) fn update_fn(&self) -> Option<UpdateFn<C>> {
        self.update.clone()
    }

    pub(crate) fn exit_fn(&self) -> Option<ExitFn> {
        self.exit.clone()
    }

    /// Apply an enter outcome to this activation.
    /// Returns true when the outcome asks a guard to proceed.
    pub(crate) fn install(&mut self, outcome: EnterOutcome<C>) -> bool {
        match outcome {
            EnterOutcome::None => false,
            EnterOutcome::Proceed => true,
            EnterOutcome::Partial(partial) => {
                self.update = partial.update;
                self.exit = partial.exit;
                false
            }
            EnterOutcome::Exit(exit) => {
                self.exit = Some(exit);
                false
            }
        }
    }
}

impl<C> Clone for Handler<C> {
    fn clone(&self) -> Self {
        Self {
            enter: self.enter.clone(),
            update: self.update.clone(),
            exit: self.exit.clone(),
        }
    }
}

impl<C> Default for Handler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for Handler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("enter", &self.enter.is_some())
            .field("update", &self.update.is_some())
            .field("exit", &self.exit.is_some())
            .finish()
    }
}
