//! Pending-command table
//!
//! Maps an outstanding command identifier to the oneshot slot its caller is
//! waiting on. The receive loop resolves entries; callers remove their own
//! entry on timeout; teardown fails everything that is left.

use crate::error::{SeestarError, SeestarResult};
use crate::protocol::{DeviceMessage, FIRST_COMMAND_ID};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;

type ResponseSender = oneshot::Sender<SeestarResult<DeviceMessage>>;
pub(crate) type ResponseReceiver = oneshot::Receiver<SeestarResult<DeviceMessage>>;

pub(crate) struct PendingTable {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, ResponseSender>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(FIRST_COMMAND_ID),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next identifier and register a waiter for it
    pub fn register(&self) -> (u64, ResponseReceiver) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(id, tx);
        (id, rx)
    }

    /// Deliver a response. Hands the message back if nobody is waiting for `id`.
    pub fn resolve(&self, id: u64, message: DeviceMessage) -> Result<(), DeviceMessage> {
        let waiter = self.lock().remove(&id);
        match waiter {
            Some(tx) => {
                // The caller may have given up between removal and send
                let _ = tx.send(Ok(message));
                Ok(())
            }
            None => Err(message),
        }
    }

    /// Drop a waiter without resolving it (timeout or write failure)
    pub fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Fail every outstanding command
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<ResponseSender> = self.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(SeestarError::ConnectionClosed(reason.to_string())));
        }
        count
    }

    /// Whether `id` was handed out on the current connection
    pub fn was_issued(&self, id: u64) -> bool {
        id >= FIRST_COMMAND_ID && id < self.next_id.load(Ordering::SeqCst)
    }

    /// Entry removal tied to the waiting caller's scope
    pub fn guard(&self, id: u64) -> PendingGuard<'_> {
        PendingGuard { table: self, id }
    }

    /// Restart numbering for a new physical connection
    pub fn reset_ids(&self) {
        self.next_id.store(FIRST_COMMAND_ID, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn contains(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ResponseSender>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Removes its entry when dropped, including when the waiting future is cancelled
pub(crate) struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.remove(self.id);
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}
