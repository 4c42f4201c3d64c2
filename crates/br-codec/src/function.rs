//! Run-function registry.
//!
//! Run functions are compiled into the worker and looked up by name; the
//! stored payload only names the function and carries its arguments.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use br_types::{DecodeError, Trial};
use serde_json::Value;

use crate::payload::{self, Payload, PayloadKind, RunFunctionRef};

/// Signature every run function implements.
pub type RunFn = Arc<dyn Fn(&Trial, &Value) -> anyhow::Result<()> + Send + Sync>;

/// Maps function names to their implementations.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, RunFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `func` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(&Trial, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.functions.insert(name.clone(), Arc::new(func)).is_some() {
            tracing::debug!("Replaced run function registration: {}", name);
        }
        self
    }

    pub fn with<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Trial, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(name, func);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Bind a function reference to its registered implementation.
    pub fn resolve(&self, func: RunFunctionRef) -> Result<BoundRunFn, DecodeError> {
        let implementation = self
            .functions
            .get(&func.name)
            .cloned()
            .ok_or_else(|| DecodeError::UnknownFunction {
                name: func.name.clone(),
            })?;

        Ok(BoundRunFn {
            name: func.name,
            args: func.args,
            func: implementation,
        })
    }

    /// Decode a stored run-function payload into a callable.
    pub fn deserialize(&self, mimetype: &str, bytes: &[u8]) -> Result<BoundRunFn, DecodeError> {
        match payload::deserialize(mimetype, bytes)? {
            Payload::RunFunction(func) => self.resolve(func),
            other => Err(DecodeError::WrongKind {
                expected: PayloadKind::RunFunction.mimetype().to_string(),
                actual: other.kind().mimetype().to_string(),
            }),
        }
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

/// A run function bound to its arguments, ready to be applied to a trial.
#[derive(Clone)]
pub struct BoundRunFn {
    name: String,
    args: Value,
    func: RunFn,
}

impl BoundRunFn {
    /// Wrap a closure directly, bypassing the registry.
    pub fn from_fn<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Trial) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            args: Value::Null,
            func: Arc::new(move |trial: &Trial, _: &Value| func(trial)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn call(&self, trial: &Trial) -> anyhow::Result<()> {
        (self.func)(trial, &self.args)
    }
}

impl fmt::Debug for BoundRunFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundRunFn")
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}
