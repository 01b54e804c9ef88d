//! Object proxy - local stand-in for a remotely cached object
//!
//! A proxy holds no remote state, only the key its calls are forwarded
//! against. Allow-listed properties are additionally mirrored locally so
//! reads can be answered from the last-known value without a round trip.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use eyre::Result;
use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::cache::{CacheObject, ObjectMap};
use crate::command::Command;
use crate::controller::{Controller, PendingResult};

/// Local stand-in whose calls are redirected into commands against a
/// remotely cached object.
///
/// Construction submits the create command that instantiates and registers
/// the target in the worker; the proxy keeps only the generated key.
/// Cloned proxies share the key and the mirror.
#[derive(Clone)]
pub struct Proxy {
    key: String,
    controller: Controller,
    mirror_props: HashSet<String>,
    mirror: Arc<Mutex<HashMap<String, Value>>>,
}

impl Proxy {
    /// Create the target object in the worker and return its proxy.
    ///
    /// The constructor runs on the worker thread; captured arguments cross
    /// once. Auto-starts the controller if it is not yet running.
    pub fn create<T, F>(controller: &Controller, ctor: F) -> Result<Self>
    where
        T: CacheObject,
        F: FnOnce() -> T + Send + 'static,
    {
        let key = format!("proxy-{}", Uuid::now_v7());
        debug!(%key, "Proxy::create: registering remote object");

        let registered = key.clone();
        controller.submit(Command::create(move |_args| {
            let mut map = ObjectMap::new();
            map.insert(registered, Box::new(ctor()) as Box<dyn CacheObject>);
            map
        }))?;

        Ok(Self {
            key,
            controller: controller.clone(),
            mirror_props: HashSet::new(),
            mirror: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Configure the allow-list of locally mirrored properties
    pub fn with_mirror<I, S>(mut self, props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mirror_props = props.into_iter().map(Into::into).collect();
        self
    }

    /// Key the remote object is registered under
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Forward a call, fire-and-forget.
    ///
    /// A nonexistent remote method becomes a captured error on the
    /// executed command; it never raises here.
    pub fn call(&self, method: impl Into<String>, args: Vec<Value>) -> Result<()> {
        self.controller.submit_invoke(self.key.as_str(), method.into(), args)
    }

    /// Forward a call and return a handle on the completed command
    pub fn call_with_output(&self, method: impl Into<String>, args: Vec<Value>) -> Result<PendingResult> {
        self.controller.submit_invoke_with_output(self.key.as_str(), method.into(), args)
    }

    /// Last-known value of a mirrored property; no round trip
    pub fn cached(&self, prop: &str) -> Option<Value> {
        self.mirror.lock().unwrap_or_else(PoisonError::into_inner).get(prop).cloned()
    }

    /// Write-through property set: update the local mirror (when the
    /// property is allow-listed) and forward the invocation.
    pub fn set(&self, prop: &str, value: Value) -> Result<()> {
        if self.mirror_props.contains(prop) {
            self.mirror
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(prop.to_string(), value.clone());
        } else {
            debug!(key = %self.key, %prop, "set: property not mirrored, forwarding only");
        }
        self.controller.submit_invoke(self.key.as_str(), prop, vec![value])
    }
}
