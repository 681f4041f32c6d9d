use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;

use crate::protocol::Response;

/// Transmissions waiting for the client layer to report a send result.
#[derive(Debug, Default)]
pub struct PendingTransmits {
    waiting: Mutex<HashMap<String, oneshot::Sender<Response>>>,
}

impl PendingTransmits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `message_id`. Returns `None` when it is already in flight.
    ///
    /// The entry is removed when the returned guard drops, whether or not a
    /// response arrived.
    pub fn reserve(
        &self,
        message_id: &str,
    ) -> Option<(PendingGuard<'_>, oneshot::Receiver<Response>)> {
        let mut waiting = self.lock();
        if waiting.contains_key(message_id) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        waiting.insert(message_id.to_string(), tx);
        Some((
            PendingGuard {
                table: self,
                message_id: message_id.to_string(),
            },
            rx,
        ))
    }

    /// Hands `response` to the waiting transmitter. Returns false if nobody waits.
    pub fn complete(&self, message_id: &str, response: Response) -> bool {
        match self.lock().remove(message_id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Response>>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct PendingGuard<'a> {
    table: &'a PendingTransmits,
    message_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.lock().remove(&self.message_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_reaches_waiter() {
        let table = PendingTransmits::new();
        let (guard, rx) = table.reserve("m1").unwrap();

        assert!(table.complete("m1", Response::ok()));
        assert_eq!(rx.await.unwrap(), Response::ok());
        drop(guard);
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_reservation_is_refused() {
        let table = PendingTransmits::new();
        let _first = table.reserve("m1").unwrap();
        assert!(table.reserve("m1").is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_guard_drop_clears_entry() {
        let table = PendingTransmits::new();
        {
            let _reserved = table.reserve("m1").unwrap();
            assert_eq!(table.len(), 1);
        }
        assert!(table.is_empty());
        assert!(!table.complete("m1", Response::ok()));
    }
}
