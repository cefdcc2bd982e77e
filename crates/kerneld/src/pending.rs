//! Correlation table for requests awaiting an answer from the kernel.
//!
//! Each entry is a one-shot sender keyed by correlation id. An entry leaves
//! the table exactly once: resolved by a matching answer, removed by its own
//! timeout, or rejected when the session goes away.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use log::debug;
use tokio::sync::oneshot;

use crate::error::SessionError;

type Outcome<T> = Result<T, SessionError>;

struct Table<T> {
    entries: HashMap<String, oneshot::Sender<Outcome<T>>>,
    closed: bool,
}

pub struct PendingRequests<T> {
    name: &'static str,
    table: StdMutex<Table<T>>,
}

/// Receiving side of a registered request.
pub struct PendingReceiver<T> {
    id: String,
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> PendingReceiver<T> {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T> PendingRequests<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            table: StdMutex::new(Table {
                entries: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Register `id` before sending the request it correlates.
    pub fn register(&self, id: &str) -> Result<PendingReceiver<T>, SessionError> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| SessionError::Protocol("pending table poisoned".into()))?;
        if table.closed {
            return Err(SessionError::Disposed);
        }
        if table.entries.contains_key(id) {
            return Err(SessionError::Protocol(format!(
                "correlation id {} is already pending",
                id
            )));
        }
        let (tx, rx) = oneshot::channel();
        table.entries.insert(id.to_string(), tx);
        Ok(PendingReceiver {
            id: id.to_string(),
            rx,
        })
    }

    /// Deliver `outcome` to the request registered under `id`. Returns
    /// `false` if nothing is waiting (late or duplicate answer).
    pub fn resolve(&self, id: &str, outcome: Outcome<T>) -> bool {
        let sender = self.table.lock().ok().and_then(|mut t| t.entries.remove(id));
        match sender {
            Some(tx) => {
                // The waiter may have just timed out; that still counts as
                // the single resolution.
                let _ = tx.send(outcome);
                true
            }
            None => {
                debug!("[session] Dropping {} answer for unknown id {}", self.name, id);
                false
            }
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        self.table
            .lock()
            .ok()
            .and_then(|mut t| t.entries.remove(id))
            .is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.table
            .lock()
            .map(|t| t.entries.contains_key(id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.table.lock().map(|t| t.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reject everything pending and refuse new registrations.
    pub fn close(&self, reason: impl Fn() -> SessionError) {
        let drained: Vec<_> = match self.table.lock() {
            Ok(mut table) => {
                table.closed = true;
                table.entries.drain().collect()
            }
            Err(_) => return,
        };
        for (id, tx) in drained {
            debug!("[session] Rejecting pending {} {}", self.name, id);
            let _ = tx.send(Err(reason()));
        }
    }

    /// Await the answer for `pending`. On timeout the entry is removed and
    /// the caller gets `Timeout { operation }`.
    pub async fn wait(
        &self,
        pending: PendingReceiver<T>,
        timeout: Duration,
        operation: &str,
    ) -> Outcome<T> {
        let PendingReceiver { id, rx } = pending;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without an answer
            Ok(Err(_)) => Err(SessionError::Disposed),
            Err(_) => {
                self.remove(&id);
                Err(SessionError::timeout(operation))
            }
        }
    }
}
