//! Command model - the unit of work that crosses the worker boundary
//!
//! A command is created once by the submitter, executed exactly once by the
//! worker, and - if it carries output - placed exactly once on the result
//! queue. Worker-side failures are captured on the command's error field;
//! they never cross the boundary as panics.

use std::any::Any;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::cache::{CacheError, CacheObject, ObjectMap};

/// Errors captured on an executed command
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    /// The factory did not produce an [`ObjectMap`]
    #[error("factory contract violation: {0}")]
    FactoryContract(String),

    /// No object was bound to the key at invocation time
    #[error("no object bound to key '{0}'")]
    NotFound(String),

    /// The method was missing or failed during execution
    #[error("invoking '{method}' on '{key}' failed: {message}")]
    Invocation {
        key: String,
        method: String,
        message: String,
    },

    /// The key is already bound and overwrite was not requested
    #[error("key '{0}' is already bound")]
    Conflict(String),
}

impl From<CacheError> for CommandError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::AlreadyBound(key) => CommandError::Conflict(key),
            CacheError::NotFound(key) => CommandError::NotFound(key),
        }
    }
}

/// Factory payload for create commands.
///
/// Runs on the worker thread with the command's args. The contract: return
/// a boxed [`ObjectMap`]. Any other return type is captured as
/// [`CommandError::FactoryContract`] at execution time - the check is
/// dynamic because the factory output is only ever inspected in the worker.
pub type FactoryFn = Box<dyn FnOnce(Vec<Value>) -> Box<dyn Any> + Send>;

/// Create-side payload: a factory to run, or a pre-built object to bind.
///
/// Consumed at execution; a create command cannot run twice.
pub enum CreateOp {
    /// Run the factory and register every entry of the returned map
    Factory(FactoryFn),
    /// Register one pre-built object under a fixed key
    Literal {
        key: String,
        object: Box<dyn CacheObject + Send>,
    },
}

impl fmt::Debug for CreateOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreateOp::Factory(_) => f.write_str("Factory"),
            CreateOp::Literal { key, .. } => f.debug_struct("Literal").field("key", key).finish(),
        }
    }
}

/// A create-and-register command
#[derive(Debug)]
pub struct CreateCommand {
    /// Taken by the worker when the command executes
    pub(crate) op: Option<CreateOp>,
    /// Positional arguments passed to the factory
    pub args: Vec<Value>,
    /// Forcibly rebind keys that are already bound
    pub overwrite: bool,
}

/// An invoke-by-name command
#[derive(Debug, Clone)]
pub struct InvokeCommand {
    /// Cache key of the target object
    pub key: String,
    /// Method name resolved on the object at execution time
    pub method: String,
    /// Positional arguments passed to the method
    pub args: Vec<Value>,
}

/// The two kinds of work a command can describe
#[derive(Debug)]
pub enum CommandKind {
    Create(CreateCommand),
    Invoke(InvokeCommand),
}

/// A description of work that crosses the worker boundary for execution
#[derive(Debug)]
pub struct Command {
    /// Unique id, usable as the event key for matching results
    pub id: String,
    /// What to execute
    pub kind: CommandKind,
    /// Place the executed command on the result queue
    pub has_output: bool,
    /// When the submitter built the command
    pub submitted_at: DateTime<Utc>,
    /// Stamped by the worker after execution
    pub completed_at: Option<DateTime<Utc>>,
    /// Success value recorded by the worker
    pub result: Option<Value>,
    /// Failure recorded by the worker
    pub error: Option<CommandError>,
}

impl Command {
    fn new(kind: CommandKind) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            kind,
            has_output: false,
            submitted_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
        }
    }

    /// Create command with a well-typed factory
    pub fn create<F>(factory: F) -> Self
    where
        F: FnOnce(Vec<Value>) -> ObjectMap + Send + 'static,
    {
        Self::create_dyn(move |args| Box::new(factory(args)) as Box<dyn Any>)
    }

    /// Create command with a dynamic factory.
    ///
    /// The [`ObjectMap`] contract is checked when the worker executes the
    /// command, not here.
    pub fn create_dyn<F>(factory: F) -> Self
    where
        F: FnOnce(Vec<Value>) -> Box<dyn Any> + Send + 'static,
    {
        Self::new(CommandKind::Create(CreateCommand {
            op: Some(CreateOp::Factory(Box::new(factory))),
            args: Vec::new(),
            overwrite: false,
        }))
    }

    /// Create command registering a pre-built object under `key`.
    ///
    /// The object crosses to the worker once and stays there; the completed
    /// command carries the success marker, not the object.
    pub fn create_object(key: impl Into<String>, object: impl CacheObject + Send) -> Self {
        Self::new(CommandKind::Create(CreateCommand {
            op: Some(CreateOp::Literal {
                key: key.into(),
                object: Box::new(object),
            }),
            args: Vec::new(),
            overwrite: false,
        }))
    }

    /// Invoke command calling `method` on the object bound to `key`
    pub fn invoke(key: impl Into<String>, method: impl Into<String>) -> Self {
        Self::new(CommandKind::Invoke(InvokeCommand {
            key: key.into(),
            method: method.into(),
            args: Vec::new(),
        }))
    }

    /// Set the positional arguments
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        match &mut self.kind {
            CommandKind::Create(create) => create.args = args,
            CommandKind::Invoke(invoke) => invoke.args = args,
        }
        self
    }

    /// Request that the executed command be placed on the result queue
    pub fn with_output(mut self) -> Self {
        self.has_output = true;
        self
    }

    /// Forcibly rebind keys that are already bound (create commands only)
    pub fn with_overwrite(mut self) -> Self {
        if let CommandKind::Create(create) = &mut self.kind {
            create.overwrite = true;
        }
        self
    }

    /// Short kind label for logging
    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            CommandKind::Create(_) => "create",
            CommandKind::Invoke(_) => "invoke",
        }
    }

    /// Cache key this command targets, if it has a fixed one
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            CommandKind::Create(create) => match &create.op {
                Some(CreateOp::Literal { key, .. }) => Some(key),
                _ => None,
            },
            CommandKind::Invoke(invoke) => Some(&invoke.key),
        }
    }

    /// Method name this command invokes, if any
    pub fn method(&self) -> Option<&str> {
        match &self.kind {
            CommandKind::Invoke(invoke) => Some(&invoke.method),
            CommandKind::Create(_) => None,
        }
    }

    /// Whether the executed command succeeded
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.result.is_some()
    }
}
