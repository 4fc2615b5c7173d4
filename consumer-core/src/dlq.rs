//! Narrow contract to a dead-letter-queue dispatcher. The actual Kafka producer behind it
//! is out of scope for this crate (§1); we only define what the coordinator/executor call
//! into once retries are exhausted on a `dlq`-enabled topic.

use crate::buffer::Message;
use crate::error::DlqError;

/// Implemented by the producer-side collaborator. `dispatch` republishes `message` to the
/// configured DLQ topic, tagging it with the error that exhausted retries; the caller is
/// responsible for seeking the client past the offending offset afterward.
pub trait DlqDispatcher: Send + Sync {
    fn dispatch(&self, message: &Message, error: &str) -> Result<(), DlqError>;
}

/// `DlqDispatcher` for topics with no DLQ configured; always fails with `NotConfigured` so
/// callers can tell "dispatch attempted and failed" apart from "nothing to dispatch to".
#[derive(Default)]
pub struct NoopDlqDispatcher;

impl NoopDlqDispatcher {
    pub fn new() -> Self {
        Self
    }
}

impl DlqDispatcher for NoopDlqDispatcher {
    fn dispatch(&self, _message: &Message, _error: &str) -> Result<(), DlqError> {
        Err(DlqError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        Message {
            topic: "t".into(),
            partition: 0,
            offset: 1,
            key: None,
            raw_payload: None,
            headers: Vec::new(),
            timestamp_ms: None,
        }
    }

    #[test]
    fn noop_dispatcher_reports_not_configured() {
        let dispatcher = NoopDlqDispatcher::new();
        assert!(matches!(
            dispatcher.dispatch(&message(), "boom"),
            Err(DlqError::NotConfigured)
        ));
    }
}
