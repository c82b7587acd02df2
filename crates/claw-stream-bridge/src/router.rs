//! Client-to-engine message routing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::engine::CurrentEngine;
use crate::error::{BridgeError, BridgeResult};

/// One client-submitted JSON value bound for the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope(Value);

impl Envelope {
    /// Wrap an already parsed value.
    #[must_use]
    pub const fn new(value: Value) -> Self {
        Self(value)
    }

    /// Parse a request body.
    pub fn from_slice(body: &[u8]) -> BridgeResult<Self> {
        Ok(Self(serde_json::from_slice(body)?))
    }

    /// The wrapped value.
    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.0
    }

    /// Single-line encoding written to the engine.
    pub fn to_line(&self) -> BridgeResult<String> {
        serde_json::to_string(&self.0).map_err(|e| BridgeError::Internal(e.to_string()))
    }
}

/// Hands envelopes to whichever engine incarnation is current.
///
/// Envelopes are never held back for a future incarnation: with no running
/// engine the submission fails immediately.
#[derive(Debug, Clone)]
pub struct InboundRouter {
    current: CurrentEngine,
    accepting: Arc<AtomicBool>,
    queue_capacity: usize,
}

impl InboundRouter {
    /// Route into `current`, whose writers buffer `queue_capacity` envelopes.
    #[must_use]
    pub fn new(current: CurrentEngine, queue_capacity: usize) -> Self {
        Self {
            current,
            accepting: Arc::new(AtomicBool::new(true)),
            queue_capacity,
        }
    }

    /// Queue `envelope` for the current engine without waiting.
    pub fn submit(&self, envelope: &Envelope) -> BridgeResult<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(BridgeError::ShuttingDown);
        }

        let engine = self
            .current
            .get()
            .ok_or_else(|| BridgeError::EngineUnavailable("no engine is running".into()))?;

        let line = envelope.to_line()?;
        match engine.try_send_line(line) {
            Ok(()) => {
                debug!(pid = engine.pid(), incarnation = engine.incarnation(), "envelope queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(BridgeError::QueueFull(self.queue_capacity)),
            Err(TrySendError::Closed(_)) => {
                Err(BridgeError::EngineUnavailable("engine exited".into()))
            }
        }
    }

    /// Reject every later submission.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Whether submissions are still accepted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineHandle;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn envelope(value: Value) -> Envelope {
        Envelope::new(value)
    }

    #[test]
    fn test_envelope_parsing() {
        let env = Envelope::from_slice(br#"{"id":2,"method":"ping"}"#).unwrap();
        assert_eq!(env.value(), &json!({"id": 2, "method": "ping"}));
        assert_eq!(env.to_line().unwrap(), r#"{"id":2,"method":"ping"}"#);

        let err = Envelope::from_slice(b"{not json").unwrap_err();
        assert!(matches!(err, BridgeError::InvalidEnvelope(_)));
    }

    #[test]
    fn test_multiline_body_becomes_single_line() {
        let env = Envelope::from_slice(b"{\n  \"id\": 3,\n  \"text\": \"a\\nb\"\n}").unwrap();
        let line = env.to_line().unwrap();
        assert!(!line.contains('\n'));
    }

    #[test]
    fn test_no_engine_is_unavailable() {
        let router = InboundRouter::new(CurrentEngine::new(), 4);

        let err = router.submit(&envelope(json!({"id": 1}))).unwrap_err();
        assert!(matches!(err, BridgeError::EngineUnavailable(_)));
    }

    #[tokio::test]
    async fn test_submissions_keep_order() {
        let current = CurrentEngine::new();
        let (tx, mut rx) = mpsc::channel(8);
        current.install(EngineHandle::new(Some(1), 0, tx));
        let router = InboundRouter::new(current, 8);

        for id in 0..5 {
            router.submit(&envelope(json!({ "id": id }))).unwrap();
        }

        for id in 0..5 {
            assert_eq!(rx.recv().await.unwrap(), format!(r#"{{"id":{id}}}"#));
        }
    }

    #[test]
    fn test_full_queue_rejects_immediately() {
        let current = CurrentEngine::new();
        let (tx, _rx) = mpsc::channel(2);
        current.install(EngineHandle::new(Some(1), 0, tx));
        let router = InboundRouter::new(current, 2);

        router.submit(&envelope(json!(1))).unwrap();
        router.submit(&envelope(json!(2))).unwrap();
        let err = router.submit(&envelope(json!(3))).unwrap_err();

        assert!(matches!(err, BridgeError::QueueFull(2)));
    }

    #[test]
    fn test_closed_writer_is_unavailable() {
        let current = CurrentEngine::new();
        let (tx, rx) = mpsc::channel(2);
        current.install(EngineHandle::new(Some(1), 0, tx));
        drop(rx);
        let router = InboundRouter::new(current, 2);

        let err = router.submit(&envelope(json!(1))).unwrap_err();
        assert!(matches!(err, BridgeError::EngineUnavailable(_)));
    }

    #[tokio::test]
    async fn test_router_follows_swapped_engine() {
        let current = CurrentEngine::new();
        let router = InboundRouter::new(current.clone(), 4);

        let (old_tx, mut old_rx) = mpsc::channel(4);
        current.install(EngineHandle::new(Some(1), 0, old_tx));
        router.submit(&envelope(json!("first"))).unwrap();

        let (new_tx, mut new_rx) = mpsc::channel(4);
        current.install(EngineHandle::new(Some(2), 1, new_tx));
        router.submit(&envelope(json!("second"))).unwrap();

        assert_eq!(old_rx.recv().await.unwrap(), r#""first""#);
        assert_eq!(new_rx.recv().await.unwrap(), r#""second""#);
        assert!(old_rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_router_rejects() {
        let current = CurrentEngine::new();
        let (tx, _rx) = mpsc::channel(2);
        current.install(EngineHandle::new(Some(1), 0, tx));
        let router = InboundRouter::new(current, 2);

        router.close();
        assert!(!router.is_accepting());
        assert!(matches!(
            router.submit(&envelope(json!(1))),
            Err(BridgeError::ShuttingDown)
        ));
    }
}
