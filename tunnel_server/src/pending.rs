//! Pending-request table.
//!
//! Correlates outstanding REQUEST envelopes with the eventual
//! RESPONSE/ERROR that answers them.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::oneshot;
use tunnel_common::{ErrorPayload, ResponsePayload};

/// What a pending request is eventually resolved with.
#[derive(Debug)]
pub enum Outcome {
    Response(ResponsePayload),
    Error(ErrorPayload),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PendingError {
    #[error("a pending request with this correlation id is already registered")]
    DuplicateCorrelationId,
}

/// Tracks in-flight requests awaiting a RESPONSE or ERROR envelope from
/// the client, keyed by correlation id.
pub struct PendingTable {
    inner: Mutex<HashMap<String, oneshot::Sender<Outcome>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new correlation id, returning the receiving half of the
    /// channel the caller should await. Fails if the id is already in use
    /// (§4.4 edge case: duplicate correlation id).
    pub fn put(&self, correlation_id: String) -> Result<oneshot::Receiver<Outcome>, PendingError> {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.inner.lock().unwrap();
        if guard.contains_key(&correlation_id) {
            return Err(PendingError::DuplicateCorrelationId);
        }
        guard.insert(correlation_id, tx);
        Ok(rx)
    }

    /// Resolves a pending request with a RESPONSE payload. Returns `false`
    /// if no matching pending request exists (already resolved, timed
    /// out, or never registered) — resolution is idempotent from the
    /// caller's perspective.
    pub fn complete(&self, correlation_id: &str, response: ResponsePayload) -> bool {
        self.resolve(correlation_id, Outcome::Response(response))
    }

    /// Resolves a pending request with an ERROR payload.
    pub fn fail(&self, correlation_id: &str, error: ErrorPayload) -> bool {
        self.resolve(correlation_id, Outcome::Error(error))
    }

    fn resolve(&self, correlation_id: &str, outcome: Outcome) -> bool {
        let sender = self.inner.lock().unwrap().remove(correlation_id);
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Removes a pending entry without resolving it (the waiter observes
    /// a dropped channel, i.e. a local timeout or cancellation).
    pub fn remove(&self, correlation_id: &str) {
        self.inner.lock().unwrap().remove(correlation_id);
    }

    /// Drains every pending request, dropping their senders so each
    /// waiter observes a closed channel. Used when the owning tunnel's
    /// control connection closes (§4.5).
    pub fn drain(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnel_common::ErrorCode;

    #[test]
    fn put_then_complete_resolves_the_receiver() {
        let table = PendingTable::new();
        let rx = table.put("c1".to_string()).unwrap();
        assert!(table.complete(
            "c1",
            ResponsePayload {
                status_code: 200,
                headers: HashMap::new(),
                body: None,
            }
        ));
        let outcome = rx.blocking_recv().unwrap();
        matches!(outcome, Outcome::Response(_));
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_correlation_id_is_rejected() {
        let table = PendingTable::new();
        let _rx = table.put("dup".to_string()).unwrap();
        assert_eq!(table.put("dup".to_string()).unwrap_err(), PendingError::DuplicateCorrelationId);
    }

    #[test]
    fn complete_on_unknown_id_is_a_noop() {
        let table = PendingTable::new();
        assert!(!table.complete(
            "missing",
            ResponsePayload {
                status_code: 200,
                headers: HashMap::new(),
                body: None,
            }
        ));
    }

    #[test]
    fn fail_resolves_with_error_payload() {
        let table = PendingTable::new();
        let rx = table.put("c2".to_string()).unwrap();
        assert!(table.fail("c2", ErrorPayload::new(ErrorCode::Timeout, "timed out")));
        let outcome = rx.blocking_recv().unwrap();
        matches!(outcome, Outcome::Error(_));
    }

    #[test]
    fn drain_drops_all_pending_senders() {
        let table = PendingTable::new();
        let rx1 = table.put("a".to_string()).unwrap();
        let rx2 = table.put("b".to_string()).unwrap();
        table.drain();
        assert!(table.is_empty());
        assert!(rx1.blocking_recv().is_err());
        assert!(rx2.blocking_recv().is_err());
    }
}
