use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use voiceloop_core::types::RequestId;

use crate::traits::EventSink;

/// Shown to the user when a tool call needs approval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfirmationRequest {
    pub id: RequestId,
    pub tool: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    Approved,
    Denied,
    // The pending set was cleared (session replaced) before an answer came.
    Abandoned,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("too many pending confirmations (limit {0})")]
    TableFull(usize),
}

type Table = HashMap<RequestId, oneshot::Sender<bool>>;

/// Correlates gated tool calls with the user's approve/deny answers.
///
/// The pending table is bounded and only touched under its lock, so
/// `resolve` and `abandon_all` never race each other.
pub struct ConfirmationBroker {
    pending: Arc<Mutex<Table>>,
    max_pending: usize,
    sink: Arc<dyn EventSink>,
}

impl ConfirmationBroker {
    pub fn new(max_pending: usize, sink: Arc<dyn EventSink>) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            max_pending: max_pending.max(1),
            sink,
        }
    }

    /// Registers a pending confirmation and notifies the UI.
    pub fn request(
        &self,
        tool: &str,
        args: &serde_json::Value,
    ) -> Result<PendingConfirmation, BrokerError> {
        let id = RequestId::new();
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if table.len() >= self.max_pending {
                return Err(BrokerError::TableFull(self.max_pending));
            }
            table.insert(id.clone(), tx);
        }

        let request = ConfirmationRequest {
            id: id.clone(),
            tool: tool.to_string(),
            args: args.clone(),
        };
        log::info!("tool '{tool}' awaiting confirmation ({id})");
        self.sink.on_tool_confirmation(&request);

        Ok(PendingConfirmation {
            id,
            rx: Some(rx),
            table: Arc::clone(&self.pending),
        })
    }

    /// Completes the pending confirmation `id`. Returns whether it was found.
    pub fn resolve(&self, id: &RequestId, approved: bool) -> bool {
        let tx = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match tx {
            Some(tx) => {
                // The waiter may already be gone; that is fine.
                let _ = tx.send(approved);
                true
            }
            None => {
                log::warn!("confirmation {id} is not pending (already resolved or abandoned)");
                false
            }
        }
    }

    /// Drops every pending confirmation. Waiters observe `Abandoned`.
    pub fn abandon_all(&self) -> usize {
        let drained: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        if !drained.is_empty() {
            log::info!("abandoning {} pending confirmation(s)", drained.len());
        }
        drained.len()
    }

    pub fn pending_ids(&self) -> Vec<RequestId> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle for one outstanding confirmation. Dropping it removes the entry.
pub struct PendingConfirmation {
    id: RequestId,
    rx: Option<oneshot::Receiver<bool>>,
    table: Arc<Mutex<Table>>,
}

impl PendingConfirmation {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub async fn wait(mut self) -> ConfirmationOutcome {
        let Some(rx) = self.rx.take() else {
            return ConfirmationOutcome::Abandoned;
        };
        match rx.await {
            Ok(true) => ConfirmationOutcome::Approved,
            Ok(false) => ConfirmationOutcome::Denied,
            Err(_) => ConfirmationOutcome::Abandoned,
        }
    }
}

impl Drop for PendingConfirmation {
    fn drop(&mut self) {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
