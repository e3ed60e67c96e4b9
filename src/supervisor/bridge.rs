//! Invocation bridge: pending calls across the process boundary.
//!
//! Calls made through a function module are first *buffered*. When a worker is
//! accessible they are *released* (sent as `invoke` messages) and move to the
//! *in-flight* map until the matching `invocationResult` arrives. Each entry
//! owns a oneshot sender, so completing it consumes it and no call can be
//! completed twice.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;
use tokio::sync::oneshot;

use super::error::ModuleError;
use crate::protocol::{CorrelationId, Inbound, InvocationOutcome, ModuleReady, Outbound};

/// Single-use completion sink of one invocation
pub type Completion = oneshot::Sender<Result<Value, ModuleError>>;

struct PendingInvocation {
    correlation_id: CorrelationId,
    args: Vec<Value>,
    sink: Completion,
}

/// Receives demultiplexed worker messages
pub trait InboundHandler {
    fn on_module_ready(&mut self, ready: ModuleReady);
    fn on_invocation_result(&mut self, correlation_id: CorrelationId, result: InvocationOutcome);
}

/// Route a worker message to the matching handler; unknown kinds are dropped.
pub fn dispatch<H: InboundHandler + ?Sized>(message: Inbound, handler: &mut H) {
    match message {
        Inbound::ModuleReady(ready) => handler.on_module_ready(ready),
        Inbound::InvocationResult {
            correlation_id,
            result,
        } => handler.on_invocation_result(correlation_id, result),
        Inbound::Unknown => tracing::debug!("Ignoring worker message of unknown kind"),
    }
}

#[derive(Default)]
pub struct InvocationBridge {
    buffered: VecDeque<PendingInvocation>,
    in_flight: HashMap<CorrelationId, Completion>,
    next_id: CorrelationId,
}

impl InvocationBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a call until a worker can take it.
    pub fn buffer(&mut self, args: Vec<Value>, sink: Completion) -> CorrelationId {
        let correlation_id = self.next_id;
        self.next_id += 1;
        self.buffered.push_back(PendingInvocation {
            correlation_id,
            args,
            sink,
        });
        correlation_id
    }

    /// Hand every buffered call to `send` in FIFO order. Returns how many
    /// calls were released.
    pub fn release<F>(&mut self, mut send: F) -> usize
    where
        F: FnMut(Outbound),
    {
        let mut released = 0;
        while let Some(pending) = self.buffered.pop_front() {
            send(Outbound::Invoke {
                correlation_id: pending.correlation_id,
                args: pending.args,
            });
            self.in_flight.insert(pending.correlation_id, pending.sink);
            released += 1;
        }
        released
    }

    /// Complete the in-flight call matching `correlation_id`.
    ///
    /// Returns `false` for ids with no in-flight entry (stale or duplicate
    /// results), which are otherwise ignored.
    pub fn resolve(&mut self, correlation_id: CorrelationId, result: InvocationOutcome) -> bool {
        let Some(sink) = self.in_flight.remove(&correlation_id) else {
            tracing::debug!("No pending invocation for correlation id {}", correlation_id);
            return false;
        };

        let outcome = if result.error {
            Err(ModuleError::Invocation(error_message(result.data)))
        } else {
            Ok(result.data)
        };
        // the caller may have stopped waiting
        let _ = sink.send(outcome);
        true
    }

    pub fn has_buffered(&self) -> bool {
        !self.buffered.is_empty()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Fail every call that was never sent.
    pub fn discard_all(&mut self, error: ModuleError) -> usize {
        let discarded = self.buffered.len();
        for pending in self.buffered.drain(..) {
            let _ = pending.sink.send(Err(error.clone()));
        }
        discarded
    }

    /// Fail every call sent to a worker that is gone.
    pub fn abandon_in_flight(&mut self, error: ModuleError) -> usize {
        let abandoned = self.in_flight.len();
        for (_, sink) in self.in_flight.drain() {
            let _ = sink.send(Err(error.clone()));
        }
        abandoned
    }
}

fn error_message(data: Value) -> String {
    match data {
        Value::String(message) => message,
        Value::Null => "Invocation failed".to_string(),
        other => other.to_string(),
    }
}
