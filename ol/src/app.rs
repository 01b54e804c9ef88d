//! Application wrapper - couples the embedding application with a controller
//!
//! The wrapper provides scoped lifecycle: the controller is started before
//! the scoped future runs and stopped on every exit path, including panic.

use std::panic::AssertUnwindSafe;

use eyre::Result;
use futures::FutureExt;
use serde_json::Value;
use tracing::warn;

use crate::cache::{CacheObject, ObjectMap};
use crate::command::Command;
use crate::controller::{Controller, ControllerConfig, PendingResult};

/// Couples the primary task's run loop with one controller.
pub struct App {
    controller: Controller,
}

impl App {
    /// Create an app with a plain controller
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            controller: Controller::new(config),
        }
    }

    /// Wrap an existing controller (built with an initializer, output
    /// handlers, or a custom host)
    pub fn with_controller(controller: Controller) -> Self {
        Self { controller }
    }

    /// The underlying controller
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    /// Run `fut` with the worker up, stopping it on every exit path.
    ///
    /// The controller is started first; whether the future succeeds, fails,
    /// or panics, the controller is stopped before this returns (panics are
    /// resumed after cleanup).
    pub async fn scope<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.controller.start()?;

        let outcome = AssertUnwindSafe(fut).catch_unwind().await;
        let stopped = self.controller.stop().await;

        match outcome {
            Ok(result) => {
                stopped?;
                result
            }
            Err(panic) => {
                if let Err(error) = stopped {
                    warn!(%error, "scope: stop failed during panic unwind");
                }
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Run a factory in the worker and register the objects it returns
    pub fn save_objects<F>(&self, factory: F) -> Result<()>
    where
        F: FnOnce(Vec<Value>) -> ObjectMap + Send + 'static,
    {
        self.controller.submit_create(factory)
    }

    /// Register a pre-built object under `key` in the worker's cache
    pub fn cache_object(&self, key: impl Into<String>, object: impl CacheObject + Send) -> Result<()> {
        self.controller.cache_object(key, object)
    }

    /// Invoke a method on a registered object, fire-and-forget
    pub fn invoke(&self, key: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Result<()> {
        self.controller.submit_invoke(key, method, args)
    }

    /// Invoke a method and return a handle on the completed command
    pub fn invoke_with_output(
        &self,
        key: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<PendingResult> {
        self.controller.submit_invoke_with_output(key, method, args)
    }

    /// Enqueue a prepared command
    pub fn submit(&self, command: Command) -> Result<()> {
        self.controller.submit(command)
    }

    /// Wait until every previously submitted command has executed
    pub async fn flush(&self) -> Result<()> {
        self.controller.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MethodError;
    use crate::controller::LifecycleState;
    use eyre::eyre;
    use serde_json::json;

    struct Counter {
        count: i64,
    }

    impl CacheObject for Counter {
        fn invoke(&mut self, method: &str, _args: &[Value]) -> Result<Value, MethodError> {
            match method {
                "increment" => {
                    self.count += 1;
                    Ok(json!(self.count))
                }
                "value" => Ok(json!(self.count)),
                other => Err(MethodError::Unknown(other.to_string())),
            }
        }
    }

    fn counter_map(start: i64) -> ObjectMap {
        let mut map = ObjectMap::new();
        map.insert("counter".to_string(), Box::new(Counter { count: start }) as Box<dyn CacheObject>);
        map
    }

    #[tokio::test]
    async fn test_scope_runs_and_stops() {
        let app = App::new(ControllerConfig::default());

        let value = app
            .scope(async {
                app.save_objects(|_args| counter_map(0))?;
                app.invoke("counter", "increment", vec![])?;
                let completed = app.invoke_with_output("counter", "value", vec![])?.wait().await?;
                Ok(completed.result)
            })
            .await
            .unwrap();

        assert_eq!(value, Some(json!(1)));
        assert_eq!(app.controller().state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_scope_stops_on_error() {
        let app = App::new(ControllerConfig::default());

        let outcome: Result<()> = app
            .scope(async {
                app.save_objects(|_args| counter_map(0))?;
                Err(eyre!("application failed"))
            })
            .await;

        assert!(outcome.is_err());
        assert_eq!(app.controller().state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_scope_stops_on_panic() {
        let app = App::new(ControllerConfig::default());

        let caught = AssertUnwindSafe(app.scope(async {
            app.save_objects(|_args| counter_map(0))?;
            if app.controller().is_running() {
                panic!("application panicked");
            }
            Ok(())
        }))
        .catch_unwind()
        .await;

        assert!(caught.is_err());
        assert_eq!(app.controller().state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_flush_through_app() {
        let app = App::new(ControllerConfig::default());
        app.save_objects(|_args| counter_map(10)).unwrap();
        app.flush().await.unwrap();
        app.controller().stop().await.unwrap();
    }
}
