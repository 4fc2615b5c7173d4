//! Error taxonomy for the consumer core. Driver errors are classified into [`DriverErrorKind`]
//! so the client can apply a uniform retry/report policy without matching on `rdkafka`'s
//! `RDKafkaErrorCode` at every call site.

use thiserror::Error;

/// Canonical classification of a driver-reported error, independent of the concrete driver.
/// Named after the Kafka protocol error codes the core cares about (§7 of the design).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverErrorKind {
    AssignmentLost,
    UnknownMemberId,
    NoOffset,
    CoordinatorLoadInProgress,
    NetworkException,
    Transport,
    MaxPollExceeded,
    UnknownTopicOrPart,
    /// Anything else the driver can report; treated as fatal unless explicitly retried.
    Other,
}

impl DriverErrorKind {
    /// Whether this kind is subject to the bounded retry-with-backoff policy in
    /// [`crate::client::Client::batch_poll`].
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            DriverErrorKind::NetworkException
                | DriverErrorKind::Transport
                | DriverErrorKind::MaxPollExceeded
                | DriverErrorKind::UnknownTopicOrPart
                | DriverErrorKind::CoordinatorLoadInProgress
        )
    }

    /// Whether the first occurrence of this kind should be reported to the monitor even
    /// while retries continue, so an operator sees it without waiting for exhaustion.
    pub fn reports_early(self) -> bool {
        matches!(
            self,
            DriverErrorKind::MaxPollExceeded
                | DriverErrorKind::NetworkException
                | DriverErrorKind::Transport
                | DriverErrorKind::UnknownTopicOrPart
        )
    }
}

/// Errors raised by [`crate::client::Client`] operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("kafka driver error: {kind:?}: {message}")]
    Driver {
        kind: DriverErrorKind,
        message: String,
    },
    #[error("seek failed: no offset resolved for the requested timestamp")]
    InvalidTimeBasedOffset,
    #[error("operation attempted after client close")]
    Closed,
    #[error("poll retries exhausted ({attempts} attempts) for: {message}")]
    RetriesExhausted { attempts: u32, message: String },
}

impl ClientError {
    pub fn driver(kind: DriverErrorKind, message: impl Into<String>) -> Self {
        ClientError::Driver {
            kind,
            message: message.into(),
        }
    }
}

/// Errors constructing a validated configuration value from external input.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be > 0")]
    MustBePositive { field: &'static str },
    #[error("shutdown_timeout ({shutdown_timeout_ms}ms) must be strictly greater than max_wait_time ({max_wait_time_ms}ms)")]
    ShutdownTimeoutTooShort {
        shutdown_timeout_ms: u64,
        max_wait_time_ms: u64,
    },
    #[error("pause_max_timeout ({pause_max_timeout_ms}ms) must be >= pause_timeout ({pause_timeout_ms}ms)")]
    PauseMaxTimeoutTooShort {
        pause_max_timeout_ms: u64,
        pause_timeout_ms: u64,
    },
    #[error("duplicate topic name within subscription group: {0}")]
    DuplicateTopic(String),
    #[error("subscription group must declare at least one topic")]
    NoTopics,
    #[error("invalid client_id: {0}")]
    InvalidClientId(String),
}

/// Errors surfaced by the [`crate::dlq::DlqDispatcher`] contract.
#[derive(Debug, Error)]
pub enum DlqError {
    #[error("dlq dispatch failed: {0}")]
    DispatchFailed(String),
    #[error("dlq not configured for this topic")]
    NotConfigured,
}

/// A worker-thread error, always caught at the top of the worker loop; never propagated.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("consumer hook {hook} failed: {source}")]
    Hook {
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("consumer hook {hook} panicked")]
    Panicked { hook: &'static str },
}
