//! Service dispatch tables.
//!
//! A [`Service`] maps method names to invokers that decode wire arguments,
//! run a handler, and encode the reply. Handlers are registered explicitly
//! by arity (`method0`..`method3`); argument and reply types only need
//! serde implementations, which is what makes a method invokable over the
//! wire in the first place.
//!
//! Naming follows the export rule: a service or method name must start
//! with an uppercase letter to be reachable remotely. A non-exported
//! service name fails construction; a non-exported method name is skipped
//! with a warning, matching the silent-exclusion rule for ineligible
//! methods.
//!
//! A handler returning `()` (or any value serializing to null) is a
//! "no output" method: the response carries a null reply.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

type Invoker = Box<dyn Fn(Vec<Value>) -> Result<Option<Value>, DispatchError> + Send + Sync>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Registration-time configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefineError {
    #[error("service name `{0}` must be exported")]
    NotExported(String),
    #[error("service `{0}` already defined")]
    AlreadyDefined(String),
}

/// Per-invocation dispatch errors, carried back as response error text.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    #[error("expected {expected} arguments, got {got}")]
    Arity { expected: usize, got: usize },
    #[error("argument {index} decode error: {source}")]
    Argument {
        index: usize,
        source: serde_json::Error,
    },
    #[error("reply encode error: {0}")]
    Reply(serde_json::Error),
}

fn is_exported(name: &str) -> bool {
    name.chars().next().is_some_and(char::is_uppercase)
}

// ---------------------------------------------------------------------------
// Method entry
// ---------------------------------------------------------------------------

struct Method {
    invoker: Invoker,
    arity: usize,
    calls: AtomicU64,
}

impl std::fmt::Debug for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("arity", &self.arity)
            .field("calls", &self.calls)
            .finish_non_exhaustive()
    }
}

fn decode_arg<A: DeserializeOwned>(value: Value, index: usize) -> Result<A, DispatchError> {
    serde_json::from_value(value).map_err(|source| DispatchError::Argument { index, source })
}

fn encode_reply<R: Serialize>(reply: R) -> Result<Option<Value>, DispatchError> {
    let value = serde_json::to_value(reply).map_err(DispatchError::Reply)?;
    Ok(if value.is_null() { None } else { Some(value) })
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builds a [`Service`] by registering handlers of fixed arity.
#[derive(Debug)]
pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, Method>,
}

impl ServiceBuilder {
    /// Start a dispatch table for `name`. Fails when the name is not
    /// exported.
    pub fn new(name: &str) -> Result<ServiceBuilder, DefineError> {
        if !is_exported(name) {
            return Err(DefineError::NotExported(name.to_owned()));
        }
        Ok(ServiceBuilder {
            name: name.to_owned(),
            methods: HashMap::new(),
        })
    }

    pub fn method0<R, F>(self, name: &str, handler: F) -> Self
    where
        R: Serialize,
        F: Fn() -> R + Send + Sync + 'static,
    {
        self.insert(name, 0, move |_args| encode_reply(handler()))
    }

    pub fn method1<A, R, F>(self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> R + Send + Sync + 'static,
    {
        self.insert(name, 1, move |mut args| {
            let a = decode_arg(args.remove(0), 0)?;
            encode_reply(handler(a))
        })
    }

    pub fn method2<A, B, R, F>(self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned,
        B: DeserializeOwned,
        R: Serialize,
        F: Fn(A, B) -> R + Send + Sync + 'static,
    {
        self.insert(name, 2, move |mut args| {
            let b = decode_arg(args.remove(1), 1)?;
            let a = decode_arg(args.remove(0), 0)?;
            encode_reply(handler(a, b))
        })
    }

    pub fn method3<A, B, C, R, F>(self, name: &str, handler: F) -> Self
    where
        A: DeserializeOwned,
        B: DeserializeOwned,
        C: DeserializeOwned,
        R: Serialize,
        F: Fn(A, B, C) -> R + Send + Sync + 'static,
    {
        self.insert(name, 3, move |mut args| {
            let c = decode_arg(args.remove(2), 2)?;
            let b = decode_arg(args.remove(1), 1)?;
            let a = decode_arg(args.remove(0), 0)?;
            encode_reply(handler(a, b, c))
        })
    }

    pub fn build(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }

    fn insert<F>(mut self, name: &str, arity: usize, invoke: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Option<Value>, DispatchError> + Send + Sync + 'static,
    {
        if !is_exported(name) {
            warn!(service = %self.name, method = name, "skipping non-exported method");
            return self;
        }
        self.methods.insert(
            name.to_owned(),
            Method {
                invoker: Box::new(invoke),
                arity,
                calls: AtomicU64::new(0),
            },
        );
        self
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// An immutable dispatch table, shared across connections once registered.
pub struct Service {
    name: String,
    methods: HashMap<String, Method>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Invoke `method` with wire arguments. Bumps the method's call
    /// counter before running the handler.
    pub fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Option<Value>, DispatchError> {
        let entry = self
            .methods
            .get(method)
            .ok_or_else(|| DispatchError::UnknownMethod(method.to_owned()))?;
        if args.len() != entry.arity {
            return Err(DispatchError::Arity {
                expected: entry.arity,
                got: args.len(),
            });
        }
        entry.calls.fetch_add(1, Ordering::Relaxed);
        (entry.invoker)(args)
    }

    /// Times `method` has been invoked, or `None` for an unknown method.
    pub fn call_count(&self, method: &str) -> Option<u64> {
        self.methods
            .get(method)
            .map(|m| m.calls.load(Ordering::Relaxed))
    }
}
