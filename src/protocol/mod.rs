//! Worker wire protocol.
//!
//! Supervisor and worker exchange newline-delimited JSON objects over the
//! worker's stdin/stdout. Every object carries a `kind` discriminator:
//!
//! ```text
//! worker -> supervisor   {"kind":"moduleReady","type":"function"}
//!                        {"kind":"invocationResult","correlationId":3,"result":{"error":false,"data":7}}
//! supervisor -> worker   {"kind":"invoke","correlationId":3,"args":[3,4]}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Pairs an outbound `invoke` with its `invocationResult`.
/// Never reused within one unit, across restarts included.
pub type CorrelationId = u64;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Empty line")]
    Empty,
}

/// Shape of the module the worker loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleType {
    Value,
    Function,
}

/// Payload of a `moduleReady` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleReady {
    #[serde(rename = "type")]
    pub module_type: ModuleType,
    /// Present for value modules only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl ModuleReady {
    pub fn is_function(&self) -> bool {
        self.module_type == ModuleType::Function
    }
}

/// Result of one invocation as reported by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationOutcome {
    #[serde(default)]
    pub error: bool,
    #[serde(default)]
    pub data: Value,
}

/// Messages sent by the worker
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Inbound {
    ModuleReady(ModuleReady),
    InvocationResult {
        #[serde(rename = "correlationId")]
        correlation_id: CorrelationId,
        result: InvocationOutcome,
    },
    /// Any kind this supervisor does not understand
    #[serde(other)]
    Unknown,
}

/// Messages sent to the worker
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Outbound {
    Invoke {
        #[serde(rename = "correlationId")]
        correlation_id: CorrelationId,
        args: Vec<Value>,
    },
}

/// Decode one stdout line from the worker.
pub fn decode_line(line: &str) -> Result<Inbound, ProtocolError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::Empty);
    }
    Ok(serde_json::from_str(trimmed)?)
}

/// Encode a message as a single JSON line (trailing newline included).
pub fn encode_line(message: &Outbound) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}
