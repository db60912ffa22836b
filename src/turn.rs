//! Per-turn buffers
//!
//! The in-progress assistant text and the tool calls of the active turn.
//! Both are owned by the conversation store for the lifetime of one turn.

pub mod accumulator;
pub mod ledger;

pub use accumulator::MessageAccumulator;
pub use ledger::{ToolCallLedger, UnmatchedToolEnd, TURN_ENDED_REASON};
