//! Caller-facing module handle.
//!
//! A value module is handed out as a plain JSON snapshot; callers keep the
//! snapshot they got. A function module is always represented by the same
//! `ModuleFn`, created once per unit, so a proxy captured before a reload
//! keeps working after it.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use super::error::ModuleError;
use super::Command;

/// The current module of a unit
#[derive(Debug, Clone)]
pub enum Module {
    Value(Value),
    Function(ModuleFn),
}

impl Module {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Function(_) => None,
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Self::Function(_))
    }
}

pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Stable invocable proxy for a function module.
///
/// Calls are relayed to whichever worker is alive, or buffered until one is.
#[derive(Clone)]
pub struct ModuleFn {
    inner: Arc<ModuleFnInner>,
}

struct ModuleFnInner {
    commands: mpsc::UnboundedSender<Command>,
}

impl ModuleFn {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            inner: Arc::new(ModuleFnInner { commands }),
        }
    }

    /// Invoke the module with `args`.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value, ModuleError> {
        let (reply, reply_rx) = oneshot::channel();
        if self.inner.commands.send(Command::Invoke { args, reply }).is_err() {
            return Err(ModuleError::ExecutionOnKilledModule);
        }
        // the unit task went away with the call still queued
        reply_rx
            .await
            .unwrap_or(Err(ModuleError::ExecutionOnKilledModule))
    }

    /// Whether both handles are the very same proxy.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ModuleFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleFn")
            .field("ptr", &Arc::as_ptr(&self.inner))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum HandleState {
    Pending,
    Resolved(Module),
    Rejected(ModuleError),
}

impl HandleState {
    fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Settle-once-per-cycle slot behind `Unit::module()`.
pub struct HandleCell {
    tx: watch::Sender<HandleState>,
}

impl Default for HandleCell {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(HandleState::Pending);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<HandleState> {
        self.tx.subscribe()
    }

    pub fn resolve(&self, module: Module) {
        self.tx.send_replace(HandleState::Resolved(module));
    }

    /// Reject a handle nobody has observed settle yet.
    pub fn reject_pending(&self, error: ModuleError) {
        self.tx.send_if_modified(|state| {
            if state.is_pending() {
                *state = HandleState::Rejected(error);
                true
            } else {
                false
            }
        });
    }

    /// Reject regardless of the current state; earlier snapshots stay valid.
    pub fn reject(&self, error: ModuleError) {
        self.tx.send_replace(HandleState::Rejected(error));
    }

    /// Start a new cycle: fresh awaits wait for the next settle.
    pub fn recreate(&self) {
        self.tx.send_if_modified(|state| {
            if state.is_pending() {
                false
            } else {
                *state = HandleState::Pending;
                true
            }
        });
    }
}

/// Wait until the handle settles.
pub async fn settled(rx: &mut watch::Receiver<HandleState>) -> Result<Module, ModuleError> {
    let state = match rx.wait_for(|state| !state.is_pending()).await {
        Ok(state) => state.clone(),
        Err(_) => return Err(ModuleError::Unavailable),
    };
    match state {
        HandleState::Resolved(module) => Ok(module),
        HandleState::Rejected(error) => Err(error),
        HandleState::Pending => Err(ModuleError::Unavailable),
    }
}
