//! Object cache - worker-local registry of named live objects
//!
//! One cache exists per worker. It is created at worker start, optionally
//! pre-seeded by an initializer, and mutated only by executed commands, so
//! every mutation happens on the worker thread.

use std::any::Any;
use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// Errors from cache operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The key is bound and overwrite was not requested
    #[error("key '{0}' is already bound")]
    AlreadyBound(String),

    /// No object is bound to the key
    #[error("no object bound to key '{0}'")]
    NotFound(String),
}

/// Errors from named-method dispatch on a cached object
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MethodError {
    /// The object does not expose a method with this name
    #[error("unknown method '{0}'")]
    Unknown(String),

    /// The method ran and failed
    #[error("{0}")]
    Failed(String),
}

/// A live object hosted in the worker, dispatchable by method name.
///
/// Implementations match on the method name and apply the call to their own
/// state. The name arrives from the other side of the command queue, so an
/// unrecognized name must yield [`MethodError::Unknown`] rather than panic.
///
/// Objects live on the worker thread for their entire life. Factory products
/// never cross a thread boundary and do not need to be `Send`; only objects
/// pre-built on the submitting side (registered via a literal create
/// command) cross once and carry a `Send` bound at the submission site.
pub trait CacheObject: Any {
    /// Invoke a named method with positional JSON arguments.
    fn invoke(&mut self, method: &str, args: &[Value]) -> Result<Value, MethodError>;
}

// Test-only Debug for the trait object so `Result<&mut dyn CacheObject, _>`
// can use `.unwrap_err()` in tests. The output is never exercised (tests only
// hit this on the `Err` path); this keeps `CacheObject` free of a `Debug`
// supertrait that would force every implementor to derive it.
#[cfg(test)]
impl std::fmt::Debug for dyn CacheObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn CacheObject>")
    }
}

/// Mapping produced by factories and initializers: name -> object.
pub type ObjectMap = HashMap<String, Box<dyn CacheObject>>;

/// Worker-local registry mapping logical keys to live objects.
///
/// A key binds to at most one object at a time; rebinding is refused unless
/// overwrite is explicitly requested. There is no eviction - entries persist
/// until the worker is torn down or the key is overwritten.
#[derive(Default)]
pub struct ObjectCache {
    objects: HashMap<String, Box<dyn CacheObject>>,
}

impl ObjectCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `key` to `object`.
    ///
    /// Fails with [`CacheError::AlreadyBound`] if the key is taken and
    /// `overwrite` is false; the original binding is left intact.
    pub fn register(&mut self, key: impl Into<String>, object: Box<dyn CacheObject>, overwrite: bool) -> Result<(), CacheError> {
        let key = key.into();
        if !overwrite && self.objects.contains_key(&key) {
            debug!(%key, "register: key already bound, refusing rebind");
            return Err(CacheError::AlreadyBound(key));
        }
        debug!(%key, overwrite, "register: binding object");
        self.objects.insert(key, object);
        Ok(())
    }

    /// Register every entry of an object map.
    ///
    /// A conflict part-way through leaves the entries registered so far in
    /// place and reports the conflicting key.
    pub fn merge(&mut self, map: ObjectMap, overwrite: bool) -> Result<(), CacheError> {
        for (key, object) in map {
            self.register(key, object, overwrite)?;
        }
        Ok(())
    }

    /// Look up the object bound to `key`
    pub fn lookup_mut(&mut self, key: &str) -> Result<&mut dyn CacheObject, CacheError> {
        match self.objects.get_mut(key) {
            Some(object) => Ok(object.as_mut()),
            None => Err(CacheError::NotFound(key.to_string())),
        }
    }

    /// Whether `key` is bound
    pub fn contains(&self, key: &str) -> bool {
        self.objects.contains_key(key)
    }

    /// Number of bound objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the cache holds no objects
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
