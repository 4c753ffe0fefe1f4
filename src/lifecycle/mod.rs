//! Instance lifecycle
//!
//! The state machine, credential handling and the manager that drives
//! instances through CREATING, RUNNING, SUSPENDED and DELETED.

pub mod credentials;
mod inflight;
mod manager;
pub mod state;

pub use inflight::{InFlight, TransitionGuard};
pub use manager::InstanceLifecycleManager;
pub use state::TransitionEvent;
