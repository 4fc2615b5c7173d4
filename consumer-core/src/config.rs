//! Configuration surface consumed by the core (§6). Loading and validating these structs
//! from the environment/CLI is out of scope — callers hand this crate already-validated
//! data — but basic structural invariants are cheap enough to enforce at construction time,
//! the same way `common_kafka::config` validates shape via `envconfig` even though the
//! env-loading layer itself lives outside this crate.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::ConfigError;
use crate::executor::TopicStrategy;

/// Default retry budget for a `dlq`-enabled topic that doesn't specify its own; the
/// distilled spec leaves this as an external routing-DSL concern, but the core needs a
/// concrete number to drive its own retry-then-dispatch loop.
pub const DEFAULT_DLQ_MAX_RETRIES: u32 = 5;

/// One topic a subscription group polls.
#[derive(Debug, Clone)]
pub struct TopicConfig {
    pub name: String,
    pub manual_offset_management: bool,
    pub long_running_job: bool,
    pub dlq_topic: Option<String>,
    pub throttling: Option<ThrottlingConfig>,
    pub virtual_partitions: bool,
    pub filtering: bool,
    pub expiring: Option<Duration>,
    pub delaying: Option<Duration>,
    pub pause_timeout: Duration,
    pub pause_max_timeout: Duration,
    pub pause_with_exponential_backoff: bool,
}

impl TopicConfig {
    pub fn new(name: impl Into<String>) -> Self {
        TopicConfig {
            name: name.into(),
            manual_offset_management: false,
            long_running_job: false,
            dlq_topic: None,
            throttling: None,
            virtual_partitions: false,
            filtering: false,
            expiring: None,
            delaying: None,
            pause_timeout: Duration::from_secs(1),
            pause_max_timeout: Duration::from_secs(30),
            pause_with_exponential_backoff: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThrottlingConfig {
    pub limit: u32,
    pub interval: Duration,
}

/// Validated configuration for one subscription group / Listener / Client. Immutable after
/// construction; build with [`SubscriptionGroupConfig::try_new`].
#[derive(Debug, Clone)]
pub struct SubscriptionGroupConfig {
    pub id: String,
    pub topics: Vec<TopicConfig>,
    pub kafka: BTreeMap<String, String>,
    pub client_id: String,
    pub concurrency: usize,
    pub max_wait_time: Duration,
    pub max_messages: usize,
    pub pause_timeout: Duration,
    pub pause_max_timeout: Duration,
    pub pause_with_exponential_backoff: bool,
    pub shutdown_timeout: Duration,
    pub consumer_persistence: bool,
}

impl SubscriptionGroupConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn try_new(
        id: impl Into<String>,
        topics: Vec<TopicConfig>,
        kafka: BTreeMap<String, String>,
        client_id: impl Into<String>,
        concurrency: usize,
        max_wait_time: Duration,
        max_messages: usize,
        pause_timeout: Duration,
        pause_max_timeout: Duration,
        pause_with_exponential_backoff: bool,
        shutdown_timeout: Duration,
        consumer_persistence: bool,
    ) -> Result<Self, ConfigError> {
        let client_id = client_id.into();
        if topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }
        let mut seen = std::collections::HashSet::new();
        for t in &topics {
            if !seen.insert(t.name.clone()) {
                return Err(ConfigError::DuplicateTopic(t.name.clone()));
            }
        }
        if concurrency == 0 {
            return Err(ConfigError::MustBePositive { field: "concurrency" });
        }
        if max_wait_time.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "max_wait_time",
            });
        }
        if max_messages == 0 {
            return Err(ConfigError::MustBePositive {
                field: "max_messages",
            });
        }
        if pause_timeout.is_zero() {
            return Err(ConfigError::MustBePositive {
                field: "pause_timeout",
            });
        }
        if pause_max_timeout < pause_timeout {
            return Err(ConfigError::PauseMaxTimeoutTooShort {
                pause_max_timeout_ms: u64::try_from(pause_max_timeout.as_millis()).unwrap_or(u64::MAX),
                pause_timeout_ms: u64::try_from(pause_timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }
        if shutdown_timeout <= max_wait_time {
            return Err(ConfigError::ShutdownTimeoutTooShort {
                shutdown_timeout_ms: u64::try_from(shutdown_timeout.as_millis()).unwrap_or(u64::MAX),
                max_wait_time_ms: u64::try_from(max_wait_time.as_millis()).unwrap_or(u64::MAX),
            });
        }
        if client_id.is_empty() || !client_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-') {
            return Err(ConfigError::InvalidClientId(client_id));
        }
        Ok(SubscriptionGroupConfig {
            id: id.into(),
            topics,
            kafka,
            client_id,
            concurrency,
            max_wait_time,
            max_messages,
            pause_timeout,
            pause_max_timeout,
            pause_with_exponential_backoff,
            shutdown_timeout,
            consumer_persistence,
        })
    }

    pub fn topic(&self, name: &str) -> Option<&TopicConfig> {
        self.topics.iter().find(|t| t.name == name)
    }

    pub fn is_cooperative_sticky(&self) -> bool {
        self.kafka
            .get("partition.assignment.strategy")
            .is_some_and(|v| v.contains("cooperative-sticky"))
    }

    pub fn auto_create_topics(&self) -> bool {
        self.kafka
            .get("allow.auto.create.topics")
            .is_some_and(|v| v == "true")
    }
}

impl TopicConfig {
    /// Select this topic's strategy bundle (§4.5): one arm per topic, in the precedence
    /// order dlq > throttling > expiring > delaying > long_running_job > plain. A topic
    /// with several flags set still gets exactly one cross-cutting behavior, matching
    /// `TopicStrategy`'s sum-type design.
    pub fn strategy(&self) -> TopicStrategy {
        if self.dlq_topic.is_some() {
            TopicStrategy::Dlq {
                max_retries: DEFAULT_DLQ_MAX_RETRIES,
                pause_timeout: self.pause_timeout,
                pause_max_timeout: self.pause_max_timeout,
            }
        } else if let Some(throttling) = self.throttling {
            TopicStrategy::Throttling {
                limit: throttling.limit,
                interval: throttling.interval,
            }
        } else if let Some(ttl) = self.expiring {
            TopicStrategy::Expiring { ttl }
        } else if let Some(delay) = self.delaying {
            TopicStrategy::Delaying { delay }
        } else if self.long_running_job {
            TopicStrategy::LongRunningJob
        } else {
            TopicStrategy::Plain
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(topics: Vec<TopicConfig>) -> Result<SubscriptionGroupConfig, ConfigError> {
        SubscriptionGroupConfig::try_new(
            "g1",
            topics,
            BTreeMap::new(),
            "my-client",
            5,
            Duration::from_millis(1000),
            100,
            Duration::from_millis(1000),
            Duration::from_millis(30000),
            true,
            Duration::from_millis(5000),
            true,
        )
    }

    #[test]
    fn rejects_empty_topics() {
        assert_eq!(base(vec![]), Err(ConfigError::NoTopics));
    }

    #[test]
    fn rejects_duplicate_topic_names() {
        let err = base(vec![TopicConfig::new("t"), TopicConfig::new("t")]).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateTopic("t".to_string()));
    }

    #[test]
    fn rejects_shutdown_timeout_not_exceeding_max_wait_time() {
        let result = SubscriptionGroupConfig::try_new(
            "g1",
            vec![TopicConfig::new("t")],
            BTreeMap::new(),
            "my-client",
            5,
            Duration::from_millis(1000),
            100,
            Duration::from_millis(1000),
            Duration::from_millis(30000),
            true,
            Duration::from_millis(1000),
            true,
        );
        assert!(matches!(
            result,
            Err(ConfigError::ShutdownTimeoutTooShort { .. })
        ));
    }

    #[test]
    fn accepts_valid_config() {
        assert!(base(vec![TopicConfig::new("t")]).is_ok());
    }

    #[test]
    fn strategy_prefers_dlq_over_other_flags() {
        let mut topic = TopicConfig::new("t");
        topic.dlq_topic = Some("t_dlq".into());
        topic.throttling = Some(ThrottlingConfig {
            limit: 2,
            interval: Duration::from_secs(1),
        });
        assert!(matches!(topic.strategy(), TopicStrategy::Dlq { .. }));
    }

    #[test]
    fn strategy_falls_back_to_plain_with_no_flags() {
        assert!(matches!(TopicConfig::new("t").strategy(), TopicStrategy::Plain));
    }
}
