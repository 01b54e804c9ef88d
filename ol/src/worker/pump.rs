//! Worker pump - drains and executes one command per tick
//!
//! The pump bridges a foreign, greedy run loop with the asynchronous
//! command queue without blocking that loop. It is driven from the host
//! loop's idle hook, never a second thread, so all cache mutation happens
//! on the worker thread without locks.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, warn};

use super::LivenessFlag;
use crate::cache::{ObjectCache, ObjectMap};
use crate::command::{Command, CommandError, CommandKind, CreateCommand, CreateOp, InvokeCommand};

/// Outcome of one pump tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A command was dequeued and executed
    Executed,
    /// The command queue was empty; yield back to the host loop
    Idle,
    /// Shutdown was observed; the host must exit its run loop
    Quit,
}

/// Per-tick routine draining and executing one command per cycle.
///
/// Executing at most one command per tick bounds per-command latency by the
/// host's tick interval, in exchange for keeping every cache mutation on
/// the single worker thread.
pub struct WorkerPump {
    alive: LivenessFlag,
    commands: mpsc::UnboundedReceiver<Command>,
    results: mpsc::UnboundedSender<Command>,
    cache: ObjectCache,
}

impl WorkerPump {
    pub(crate) fn new(
        alive: LivenessFlag,
        commands: mpsc::UnboundedReceiver<Command>,
        results: mpsc::UnboundedSender<Command>,
        cache: ObjectCache,
    ) -> Self {
        Self {
            alive,
            commands,
            results,
            cache,
        }
    }

    /// Run one cycle: dequeue at most one command and execute it.
    ///
    /// The liveness flag is checked before the dequeue, so no command
    /// executes once the flag is observed cleared. Commands still queued at
    /// that point are dropped, never run (callers wanting run-to-completion
    /// flush before stopping).
    pub fn tick(&mut self) -> Tick {
        if !self.alive.is_set() {
            debug!("tick: liveness cleared, requesting run loop termination");
            return Tick::Quit;
        }

        match self.commands.try_recv() {
            Ok(command) => {
                let command = execute_command(command, &mut self.cache);
                if command.has_output {
                    if self.results.send(command).is_err() {
                        warn!("tick: result queue closed, dropping completed command");
                    }
                } else if let Some(error) = &command.error {
                    // Best-effort visibility for fire-and-forget failures
                    warn!(id = %command.id, kind = command.kind_name(), %error, "tick: output-less command failed");
                }
                Tick::Executed
            }
            Err(TryRecvError::Empty) => Tick::Idle,
            Err(TryRecvError::Disconnected) => {
                debug!("tick: command queue disconnected, requesting run loop termination");
                Tick::Quit
            }
        }
    }
}

/// Execute a command against the cache, capturing result or error on it.
///
/// Never panics and never returns early across the pump - a failing
/// command is an ordinary completed command with its error field filled.
fn execute_command(mut command: Command, cache: &mut ObjectCache) -> Command {
    debug!(id = %command.id, kind = command.kind_name(), "execute: running command");

    let outcome = match &mut command.kind {
        CommandKind::Create(create) => execute_create(create, cache),
        CommandKind::Invoke(invoke) => execute_invoke(invoke, cache),
    };

    match outcome {
        Ok(value) => command.result = Some(value),
        Err(error) => {
            debug!(id = %command.id, %error, "execute: command failed");
            command.error = Some(error);
        }
    }
    command.completed_at = Some(Utc::now());
    command
}

fn execute_create(create: &mut CreateCommand, cache: &mut ObjectCache) -> Result<Value, CommandError> {
    let op = create
        .op
        .take()
        .ok_or_else(|| CommandError::FactoryContract("create command already executed".to_string()))?;

    match op {
        CreateOp::Factory(factory) => {
            let args = std::mem::take(&mut create.args);
            let output = catch_unwind(AssertUnwindSafe(|| factory(args)))
                .map_err(|payload| CommandError::FactoryContract(format!("factory panicked: {}", panic_message(payload.as_ref()))))?;
            let map = downcast_object_map(output)?;
            cache.merge(map, create.overwrite)?;
            Ok(Value::Bool(true))
        }
        CreateOp::Literal { key, object } => {
            cache.register(key, object, create.overwrite)?;
            Ok(Value::Bool(true))
        }
    }
}

fn execute_invoke(invoke: &InvokeCommand, cache: &mut ObjectCache) -> Result<Value, CommandError> {
    let object = cache.lookup_mut(&invoke.key).map_err(CommandError::from)?;

    let outcome = catch_unwind(AssertUnwindSafe(|| object.invoke(&invoke.method, &invoke.args))).map_err(|payload| {
        CommandError::Invocation {
            key: invoke.key.clone(),
            method: invoke.method.clone(),
            message: format!("method panicked: {}", panic_message(payload.as_ref())),
        }
    })?;

    outcome.map_err(|error| CommandError::Invocation {
        key: invoke.key.clone(),
        method: invoke.method.clone(),
        message: error.to_string(),
    })
}

fn downcast_object_map(output: Box<dyn Any>) -> Result<ObjectMap, CommandError> {
    match output.downcast::<ObjectMap>() {
        Ok(map) => Ok(*map),
        Err(_) => Err(CommandError::FactoryContract(
            "factory returned something other than an object map".to_string(),
        )),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}
