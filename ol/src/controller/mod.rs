//! Event-loop controller
//!
//! Owns the command and result queues, the liveness flag, and the worker
//! thread; exposes start/stop/submit plus a background result consumer
//! dispatching completed commands to output handlers.

mod config;
mod core;

pub use config::ControllerConfig;
pub use core::{Controller, ControllerBuilder, LifecycleState, OutputHandler, PendingResult};
