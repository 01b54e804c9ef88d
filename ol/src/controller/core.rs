//! Controller core - lifecycle, queues, and the result consumer
//!
//! The controller owns both queues, the liveness flag, and the worker
//! thread handle. Commands go in through `submit`; completed commands come
//! back through a background consumer task that dispatches to output
//! handlers and per-command waiters.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use eyre::{Context, Result, eyre};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task;
use tracing::{debug, info};

use super::config::ControllerConfig;
use crate::cache::{CacheObject, ObjectMap};
use crate::command::Command;
use crate::worker::{self, HostBuilder, HostLoop, IdleLoop, Initializer, LivenessFlag};

/// Controller lifecycle states.
///
/// `Stopped` is both the initial state and the terminal one: the liveness
/// flag clears exactly once per controller lifetime, so a controller that
/// has stopped cannot be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Callback invoked with each completed command drained from the result
/// queue. Returning `true` consumes the command and stops propagation to
/// handlers registered after this one.
pub type OutputHandler = Box<dyn Fn(&Command) -> bool + Send + Sync>;

type Handlers = Arc<Mutex<Vec<OutputHandler>>>;
type Waiters = Arc<Mutex<HashMap<String, oneshot::Sender<Command>>>>;

/// Ignore mutex poisoning: a panicking handler must not wedge the controller
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A completed command promised by a `*_with_output` submission.
///
/// Resolved by the result consumer; awaiting it polls the consumer's
/// oneshot, never the worker thread.
pub struct PendingResult {
    id: String,
    rx: oneshot::Receiver<Command>,
}

impl PendingResult {
    /// Id of the command this result belongs to
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the command to complete.
    ///
    /// Fails if the controller stops before the command executes (commands
    /// still queued at shutdown are dropped, not run).
    pub async fn wait(self) -> Result<Command> {
        self.rx
            .await
            .map_err(|_| eyre!("controller stopped before command '{}' completed", self.id))
    }
}

/// Builder for controllers that need an initializer, a custom host loop,
/// or pre-registered output handlers.
pub struct ControllerBuilder {
    config: ControllerConfig,
    initializer: Option<Initializer>,
    host: Option<HostBuilder>,
    handlers: Vec<OutputHandler>,
}

impl ControllerBuilder {
    fn new() -> Self {
        Self {
            config: ControllerConfig::default(),
            initializer: None,
            host: None,
            handlers: Vec::new(),
        }
    }

    /// Use the given configuration
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Seed the worker's object cache before the pump starts
    pub fn initializer<F>(mut self, initializer: F) -> Self
    where
        F: FnOnce() -> ObjectMap + Send + 'static,
    {
        self.initializer = Some(Box::new(initializer));
        self
    }

    /// Host the pump in a custom run loop instead of the default
    /// [`IdleLoop`]. The builder runs on the worker thread, so the host
    /// itself does not need to be `Send`.
    pub fn host<H, F>(mut self, host: F) -> Self
    where
        H: HostLoop + 'static,
        F: FnOnce() -> H + Send + 'static,
    {
        self.host = Some(Box::new(move || Box::new(host()) as Box<dyn HostLoop>));
        self
    }

    /// Register an output handler for completed commands
    pub fn output_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Command) -> bool + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
        self
    }

    pub fn build(self) -> Controller {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        Controller {
            inner: Arc::new(ControllerInner {
                config: self.config,
                alive: LivenessFlag::new(),
                command_tx,
                command_rx: Mutex::new(Some(command_rx)),
                result_tx: Mutex::new(Some(result_tx)),
                result_rx: Mutex::new(Some(result_rx)),
                state: Mutex::new(LifecycleState::Stopped),
                worker: Mutex::new(None),
                consumer: Mutex::new(None),
                handlers: Arc::new(Mutex::new(self.handlers)),
                waiters: Arc::new(Mutex::new(HashMap::new())),
                initializer: Mutex::new(self.initializer),
                host: Mutex::new(self.host),
            }),
        }
    }
}

/// Owns the command/result queues, the liveness flag, and the worker.
///
/// Cheap to clone; all clones drive the same worker. Proxies hold a clone
/// to build commands against their remote key.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: ControllerConfig,
    alive: LivenessFlag,
    command_tx: mpsc::UnboundedSender<Command>,
    /// Taken by the worker thread at start
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    /// Moved into the worker at start so the result queue closes when the
    /// worker exits
    result_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    /// Taken by the result consumer at start
    result_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    state: Mutex<LifecycleState>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    consumer: Mutex<Option<task::JoinHandle<()>>>,
    handlers: Handlers,
    waiters: Waiters,
    initializer: Mutex<Option<Initializer>>,
    host: Mutex<Option<HostBuilder>>,
}

impl Drop for ControllerInner {
    fn drop(&mut self) {
        // Last handle gone without an explicit stop: ask the worker to quit
        self.alive.clear();
    }
}

impl Controller {
    /// Create a controller with the default host loop and no initializer
    pub fn new(config: ControllerConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> ControllerBuilder {
        ControllerBuilder::new()
    }

    /// Current lifecycle state
    pub fn state(&self) -> LifecycleState {
        *lock(&self.inner.state)
    }

    /// Whether the worker is up (or coming up)
    pub fn is_running(&self) -> bool {
        matches!(self.state(), LifecycleState::Starting | LifecycleState::Running)
    }

    /// Start the worker thread and the result consumer.
    ///
    /// Idempotent while running. Fails once the controller has been
    /// stopped - the liveness flag clears exactly once per lifetime. Must
    /// be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut state = lock(&self.inner.state);
        match *state {
            LifecycleState::Starting | LifecycleState::Running => {
                debug!("start: already running");
                return Ok(());
            }
            LifecycleState::Stopping => return Err(eyre!("controller is stopping")),
            LifecycleState::Stopped if self.inner.alive.was_cleared() => {
                return Err(eyre!("controller has been stopped and cannot be restarted"));
            }
            LifecycleState::Stopped => {}
        }
        *state = LifecycleState::Starting;

        let command_rx = lock(&self.inner.command_rx)
            .take()
            .ok_or_else(|| eyre!("command queue already taken"))?;
        let result_tx = lock(&self.inner.result_tx)
            .take()
            .ok_or_else(|| eyre!("result queue already taken"))?;
        let result_rx = lock(&self.inner.result_rx)
            .take()
            .ok_or_else(|| eyre!("result consumer already taken"))?;
        let initializer = lock(&self.inner.initializer).take();
        let idle_wait = self.inner.config.idle_wait();
        let host_builder = lock(&self.inner.host)
            .take()
            .unwrap_or_else(|| Box::new(move || Box::new(IdleLoop::new(idle_wait)) as Box<dyn HostLoop>));

        self.inner.alive.set();

        let alive = self.inner.alive.clone();
        let worker = thread::Builder::new()
            .name(self.inner.config.worker_thread_name.clone())
            .spawn(move || worker::run_worker(alive, command_rx, result_tx, initializer, host_builder))
            .context("Failed to spawn worker thread")?;
        *lock(&self.inner.worker) = Some(worker);

        let handlers = Arc::clone(&self.inner.handlers);
        let waiters = Arc::clone(&self.inner.waiters);
        let consumer = tokio::spawn(run_consumer(result_rx, handlers, waiters));
        *lock(&self.inner.consumer) = Some(consumer);

        *state = LifecycleState::Running;
        info!(worker = %self.inner.config.worker_thread_name, "controller started");
        Ok(())
    }

    /// Clear the liveness flag, join the worker, and drain the consumer.
    ///
    /// Shutdown policy is drop-remaining: a command already dequeued
    /// finishes; commands still queued never run. Call [`Controller::flush`]
    /// first for run-to-completion. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = lock(&self.inner.state);
            match *state {
                LifecycleState::Stopped | LifecycleState::Stopping => {
                    debug!("stop: not running");
                    return Ok(());
                }
                LifecycleState::Starting | LifecycleState::Running => *state = LifecycleState::Stopping,
            }
        }

        info!("controller stopping");
        self.inner.alive.clear();

        let worker = lock(&self.inner.worker).take();
        if let Some(handle) = worker {
            task::spawn_blocking(move || handle.join())
                .await
                .context("Worker join task failed")?
                .map_err(|_| eyre!("worker thread panicked"))?;
        }

        let consumer = lock(&self.inner.consumer).take();
        if let Some(handle) = consumer {
            handle.await.context("Result consumer task failed")?;
        }

        // Drop-remaining: waiters for commands that never executed resolve
        // as errors once their senders are gone.
        let dropped = lock(&self.inner.waiters).drain().count();
        if dropped > 0 {
            debug!(dropped, "stop: dropped waiters for commands never executed");
        }

        *lock(&self.inner.state) = LifecycleState::Stopped;
        info!("controller stopped");
        Ok(())
    }

    /// Register an output handler for completed commands.
    ///
    /// Handlers run in registration order; the first to return `true`
    /// consumes the command.
    pub fn add_output_handler<F>(&self, handler: F)
    where
        F: Fn(&Command) -> bool + Send + Sync + 'static,
    {
        lock(&self.inner.handlers).push(Box::new(handler));
    }

    /// Enqueue a command.
    ///
    /// Safe for concurrent producers. Triggers `start()` from the initial
    /// `Stopped` state when auto-start is enabled; refused once the
    /// controller is stopping or stopped.
    pub fn submit(&self, command: Command) -> Result<()> {
        self.ensure_started()?;
        debug!(id = %command.id, kind = command.kind_name(), "submit: enqueuing command");
        self.inner
            .command_tx
            .send(command)
            .map_err(|_| eyre!("command queue closed"))?;
        Ok(())
    }

    /// Enqueue a command and return a handle on its completion
    pub fn submit_with_output(&self, mut command: Command) -> Result<PendingResult> {
        command.has_output = true;
        let id = command.id.clone();

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.waiters).insert(id.clone(), tx);

        if let Err(error) = self.submit(command) {
            lock(&self.inner.waiters).remove(&id);
            return Err(error);
        }
        Ok(PendingResult { id, rx })
    }

    /// Build and enqueue a create command from a bare factory
    pub fn submit_create<F>(&self, factory: F) -> Result<()>
    where
        F: FnOnce(Vec<Value>) -> ObjectMap + Send + 'static,
    {
        self.submit(Command::create(factory))
    }

    /// Like [`Controller::submit_create`], returning the completed command
    pub fn submit_create_with_output<F>(&self, factory: F) -> Result<PendingResult>
    where
        F: FnOnce(Vec<Value>) -> ObjectMap + Send + 'static,
    {
        self.submit_with_output(Command::create(factory))
    }

    /// Register a pre-built object under `key` in the worker's cache
    pub fn cache_object(&self, key: impl Into<String>, object: impl CacheObject + Send) -> Result<()> {
        self.submit(Command::create_object(key, object))
    }

    /// Build and enqueue an invoke command from a key + method pair
    pub fn submit_invoke(&self, key: impl Into<String>, method: impl Into<String>, args: Vec<Value>) -> Result<()> {
        self.submit(Command::invoke(key, method).with_args(args))
    }

    /// Like [`Controller::submit_invoke`], returning the completed command
    pub fn submit_invoke_with_output(
        &self,
        key: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
    ) -> Result<PendingResult> {
        self.submit_with_output(Command::invoke(key, method).with_args(args))
    }

    /// Wait until every previously submitted command has executed.
    ///
    /// Submits a no-op barrier command with output and awaits it; FIFO
    /// execution makes its completion imply completion of everything
    /// submitted before it.
    pub async fn flush(&self) -> Result<()> {
        let barrier = Command::create(|_args| ObjectMap::new());
        debug!(id = %barrier.id, "flush: submitting barrier");
        let pending = self.submit_with_output(barrier)?;
        pending.wait().await?;
        Ok(())
    }

    fn ensure_started(&self) -> Result<()> {
        let state = self.state();
        match state {
            LifecycleState::Starting | LifecycleState::Running => Ok(()),
            LifecycleState::Stopping => Err(eyre!("controller is stopping; command refused")),
            LifecycleState::Stopped if self.inner.alive.was_cleared() => {
                Err(eyre!("controller is stopped; command refused"))
            }
            LifecycleState::Stopped if self.inner.config.auto_start => self.start(),
            LifecycleState::Stopped => Err(eyre!("controller not started and auto-start is disabled")),
        }
    }
}

/// Drain the result queue, dispatching each completed command to the
/// output handlers and then to its waiter, if any.
///
/// Runs in the primary task; touches no worker-owned state. Ends when the
/// worker exits and the result queue closes.
async fn run_consumer(mut results: mpsc::UnboundedReceiver<Command>, handlers: Handlers, waiters: Waiters) {
    debug!("result consumer started");
    while let Some(command) = results.recv().await {
        let consumed = {
            let handlers = lock(&handlers);
            let mut consumed = false;
            for handler in handlers.iter() {
                if handler(&command) {
                    consumed = true;
                    break;
                }
            }
            consumed
        };
        debug!(id = %command.id, consumed, error = command.error.is_some(), "result consumer: dispatched");

        let waiter = lock(&waiters).remove(&command.id);
        if let Some(tx) = waiter {
            // Waiter may have been dropped without awaiting
            let _ = tx.send(command);
        }
    }
    debug!("result consumer: result queue closed, exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MethodError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counter {
        count: i64,
    }

    impl CacheObject for Counter {
        fn invoke(&mut self, method: &str, args: &[Value]) -> Result<Value, MethodError> {
            match method {
                "increment" => {
                    self.count += 1;
                    Ok(json!(self.count))
                }
                "add" => {
                    let n = args
                        .first()
                        .and_then(Value::as_i64)
                        .ok_or_else(|| MethodError::Failed("add requires an integer argument".to_string()))?;
                    self.count += n;
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
    async fn test_auto_start_on_first_submission() {
        let controller = Controller::new(ControllerConfig::default());
        assert_eq!(controller.state(), LifecycleState::Stopped);

        controller.submit_create(|_args| counter_map(0)).unwrap();
        assert!(controller.is_running());

        controller.stop().await.unwrap();
        assert_eq!(controller.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let controller = Controller::new(ControllerConfig::default());
        controller.start().unwrap();
        controller.start().unwrap();
        assert!(controller.is_running());
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_refused_after_stop() {
        let controller = Controller::new(ControllerConfig::default());
        controller.start().unwrap();
        controller.stop().await.unwrap();

        assert!(controller.start().is_err());
        assert!(controller.submit(Command::invoke("k", "m")).is_err());
    }

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let controller = Controller::new(ControllerConfig::default());
        controller.submit_create(|_args| counter_map(0)).unwrap();

        let completed = controller
            .submit_invoke_with_output("counter", "increment", vec![])
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(completed.succeeded());
        assert_eq!(completed.result, Some(json!(1)));
        assert!(completed.completed_at.is_some());

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_results_arrive_in_submission_order() {
        let controller = Controller::new(ControllerConfig::default());
        controller.submit_create(|_args| counter_map(0)).unwrap();

        let mut pending = Vec::new();
        for _ in 0..5 {
            pending.push(controller.submit_invoke_with_output("counter", "increment", vec![]).unwrap());
        }

        let mut values = Vec::new();
        for p in pending {
            let completed = p.wait().await.unwrap();
            values.push(completed.result.unwrap());
        }
        assert_eq!(values, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_output_handlers_receive_completed_commands() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_handler = Arc::clone(&seen);

        let controller = Controller::builder()
            .output_handler(move |_command| {
                seen_in_handler.fetch_add(1, Ordering::SeqCst);
                false
            })
            .build();

        controller.submit_create(|_args| counter_map(0)).unwrap();
        for _ in 0..3 {
            controller.submit_invoke("counter", "increment", vec![]).unwrap();
        }
        // Only output-bearing commands reach the handlers
        controller
            .submit_invoke_with_output("counter", "value", vec![])
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_consuming_handler_stops_propagation() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let first_in_handler = Arc::clone(&first);
        let second_in_handler = Arc::clone(&second);

        let controller = Controller::builder()
            .output_handler(move |_command| {
                first_in_handler.fetch_add(1, Ordering::SeqCst);
                true
            })
            .output_handler(move |_command| {
                second_in_handler.fetch_add(1, Ordering::SeqCst);
                false
            })
            .build();

        controller
            .submit_create_with_output(|_args| counter_map(0))
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 0);
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_failure_surfaces_only_through_results() {
        let controller = Controller::new(ControllerConfig::default());

        let completed = controller
            .submit_invoke_with_output("ghost", "anything", vec![])
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(completed.error, Some(crate::command::CommandError::NotFound("ghost".to_string())));

        // The controller is still healthy
        controller.submit_create(|_args| counter_map(0)).unwrap();
        let completed = controller
            .submit_invoke_with_output("counter", "value", vec![])
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(completed.result, Some(json!(0)));

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_waits_for_prior_commands() {
        let controller = Controller::new(ControllerConfig::default());
        controller.submit_create(|_args| counter_map(0)).unwrap();
        for _ in 0..10 {
            controller.submit_invoke("counter", "increment", vec![]).unwrap();
        }
        controller.flush().await.unwrap();

        let completed = controller
            .submit_invoke_with_output("counter", "value", vec![])
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(completed.result, Some(json!(10)));
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_initializer_seeds_cache_before_first_command() {
        let controller = Controller::builder().initializer(|| counter_map(41)).build();

        let completed = controller
            .submit_invoke_with_output("counter", "increment", vec![])
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(completed.result, Some(json!(42)));
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_start_disabled_refuses_submission() {
        let config = ControllerConfig {
            auto_start: false,
            ..Default::default()
        };
        let controller = Controller::new(config);

        assert!(controller.submit(Command::invoke("k", "m")).is_err());

        controller.start().unwrap();
        controller.submit_create(|_args| counter_map(0)).unwrap();
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pending_result_fails_when_dropped_at_shutdown() {
        // A slow host loop guarantees queued commands are still pending
        // when stop clears the flag.
        let config = ControllerConfig {
            idle_wait_ms: 200,
            ..Default::default()
        };
        let controller = Controller::new(config);
        controller.start().unwrap();

        // Let the worker go idle so the queued burst sits behind one long
        // idle sleep.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut pending = Vec::new();
        for _ in 0..50 {
            pending.push(controller.submit_invoke_with_output("ghost", "m", vec![]).unwrap());
        }
        controller.stop().await.unwrap();

        // Drop-remaining: at least the tail of the burst never executed
        let mut dropped = 0;
        for p in pending {
            if p.wait().await.is_err() {
                dropped += 1;
            }
        }
        assert!(dropped > 0, "expected some commands to be dropped at shutdown");
    }
}
