//! Streamdesk - streaming conversation engine for an assistant CLI
//!
//! Drives an assistant subprocess that speaks line-delimited JSON events,
//! folds its stream into an ordered conversation through a pure state
//! machine, and keeps a recovery snapshot so an interrupted session can be
//! picked back up.

pub mod config;
pub mod model;
pub mod protocol;
pub mod recovery;
pub mod runtime;
pub mod state_machine;
pub mod store;
pub mod transport;
pub mod turn;
