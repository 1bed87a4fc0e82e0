//! Correlation table for outstanding client-initiated requests.

use crate::error::McpError;
use serde_json::Value;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use tether_types::RequestId;
use tokio::sync::oneshot;

/// Outcome delivered to a waiting caller: the raw `result` or an error.
pub(crate) type CallOutcome = Result<Value, McpError>;

/// One outstanding request. Resolving consumes it, so a call can be
/// completed at most once.
#[derive(Debug)]
pub(crate) struct PendingCall {
    pub method: String,
    /// Name of the type the caller will decode `result` into.
    pub result_type: &'static str,
    reply: oneshot::Sender<CallOutcome>,
}

impl PendingCall {
    pub fn new(
        method: impl Into<String>,
        result_type: &'static str,
    ) -> (Self, oneshot::Receiver<CallOutcome>) {
        let (reply, rx) = oneshot::channel();
        let call = Self {
            method: method.into(),
            result_type,
            reply,
        };
        (call, rx)
    }

    pub fn resolve(self, outcome: CallOutcome) {
        if self.reply.send(outcome).is_err() {
            tracing::debug!("Caller for '{}' went away before its reply", self.method);
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    calls: HashMap<RequestId, PendingCall>,
}

impl PendingTable {
    /// Register a call. Returns the call back if the id is already in use.
    pub fn insert(&mut self, id: RequestId, call: PendingCall) -> Result<(), PendingCall> {
        match self.calls.entry(id) {
            Entry::Occupied(_) => Err(call),
            Entry::Vacant(slot) => {
                slot.insert(call);
                Ok(())
            }
        }
    }

    pub fn remove(&mut self, id: &RequestId) -> Option<PendingCall> {
        self.calls.remove(id)
    }

    /// Retire every outstanding call. The caller resolves them outside the lock.
    pub fn drain(&mut self) -> Vec<PendingCall> {
        self.calls.drain().map(|(_, call)| call).collect()
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}
