//! Runtime: live contexts, handlers, guards and the machine facades.
//!
//! Every transition is a command queued on the parent of the node it moves.
//! Commands run synchronously when nothing else is in flight for that node;
//! otherwise they wait, and at most one waiting command is kept. Requests
//! made while a context is updating run after its children have ticked.

mod command;
pub mod config;
mod context;
pub mod error;
mod guard;
mod handler;
mod machine;

pub use config::{ConfigPatch, HsmConfig};
pub use context::{MachineState, StateContext};
pub use error::HsmError;
pub use guard::{Guard, PARENT_ORIGIN, SELF_ORIGIN};
pub use handler::{EnterFn, EnterOutcome, ExitFn, Handler, PartialHandler, UpdateFn};
pub use machine::{Fsm, Hsm};
