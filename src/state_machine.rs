//! Session lifecycle state machine
//!
//! Pure transitions in the Elm style: given the current [`Session`] and an
//! [`Input`], [`transition`] returns the next session plus the [`Effect`]s
//! the store must apply. Nothing in here performs I/O.

mod effect;
mod input;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::Effect;
pub use input::Input;
pub use state::{LifecycleState, Session};
pub use transition::{transition, Disposition, IgnoreReason, Transition, TransitionError};
