//! Core runtime of a Kafka consumer framework: polling loop, cooperative rebalancing,
//! worker scheduling, and pause/resume/offset lifecycle management.
//!
//! This crate is deliberately narrow. Configuration loading, the routing DSL that produces
//! [`config::SubscriptionGroupConfig`] values, and the producer side of the DLQ contract all
//! live outside it; this crate only consumes already-validated data and a [`driver::KafkaDriver`].

pub mod buffer;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod dlq;
pub mod driver;
pub mod error;
pub mod executor;
pub mod group_coordinator;
pub mod jobs;
pub mod listener;
pub mod monitor;
pub mod partitioner;
pub mod rebalance;
pub mod runtime;
pub mod scheduler;
pub mod time_tracker;
pub mod worker;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use buffer::{Message, MessagesBuffer, RawMessagesBuffer};
pub use client::Client;
pub use config::{SubscriptionGroupConfig, TopicConfig};
pub use coordinator::{Coordinator, CoordinatorsBuffer};
pub use driver::KafkaDriver;
pub use error::{ClientError, ConfigError, DriverErrorKind};
pub use executor::{ConsumerInstance, Executor, ExecutorsBuffer, TopicStrategy};
pub use jobs::{Job, JobKind, JobsQueue};
pub use listener::Listener;
pub use monitor::{Monitor, MonitorEvent, TracingMonitor};
pub use runtime::Runtime;
