//! offloop - host stateful objects on a dedicated single-threaded worker loop
//!
//! Some subsystems refuse to be driven from more than one thread: GUI
//! toolkits, audio engines, embedded interpreters. offloop confines such
//! objects to one long-lived worker thread and lets the rest of the
//! application address them by logical name, submitting commands instead of
//! holding references.
//!
//! # Core Concepts
//!
//! - **Commands, not references**: callers submit create/invoke commands;
//!   objects never leave the worker
//! - **One writer**: the object cache is mutated only by the worker pump,
//!   one command per tick, driven from the host loop's idle hook
//! - **Results are optional**: only output-bearing commands come back, in
//!   submission order, through the result consumer
//! - **Cooperative shutdown**: a liveness flag that clears exactly once;
//!   commands still queued at shutdown are dropped, never run
//!
//! # Modules
//!
//! - [`cache`] - worker-local object registry and the [`CacheObject`] trait
//! - [`command`] - the command model and captured error taxonomy
//! - [`worker`] - pump, host loop abstraction, and the worker entry point
//! - [`controller`] - lifecycle, queues, and the result consumer
//! - [`proxy`] - local stand-ins for remotely cached objects
//! - [`app`] - application wrapper with scoped lifecycle

pub mod app;
pub mod cache;
pub mod command;
pub mod controller;
pub mod proxy;
pub mod worker;

// Re-export commonly used types
pub use app::App;
pub use cache::{CacheError, CacheObject, MethodError, ObjectCache, ObjectMap};
pub use command::{Command, CommandError, CommandKind, CreateCommand, CreateOp, FactoryFn, InvokeCommand};
pub use controller::{Controller, ControllerBuilder, ControllerConfig, LifecycleState, OutputHandler, PendingResult};
pub use proxy::Proxy;
pub use worker::{HostBuilder, HostLoop, IdleLoop, Initializer, LivenessFlag, Tick, WorkerPump};
