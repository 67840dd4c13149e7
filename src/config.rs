use crate::error::{PipelineError, Result};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_BROKER_URL: &str = "memory://local";
pub const DEFAULT_ORDER_QUEUE: &str = "pedidos";
pub const DEFAULT_NOTIFICATION_QUEUE: &str = "notificaciones";
pub const DEFAULT_HISTORY_QUEUE: &str = "historial";
pub const DEFAULT_DEAD_LETTER_QUEUE: &str = "pedidos.dead-letter";

/// Broker endpoint. The URL carries credentials, so `Debug` and
/// [`BrokerConfig::redacted_url`] never print the password.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub url: String,
}

impl BrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn scheme(&self) -> &str {
        self.url.split_once("://").map_or("", |(scheme, _)| scheme)
    }

    /// A `memory://` broker lives inside this process; nothing outside it
    /// can publish orders to it.
    pub fn is_in_process(&self) -> bool {
        self.scheme() == "memory"
    }

    /// Username and password embedded in the URL, if any.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let (_, rest) = self.url.split_once("://")?;
        let (userinfo, _) = rest.split_once('@')?;
        Some(userinfo.split_once(':').unwrap_or((userinfo, "")))
    }

    pub fn redacted_url(&self) -> String {
        match (self.url.split_once("://"), self.credentials()) {
            (Some((scheme, rest)), Some((user, _))) => {
                let host = rest.split_once('@').map_or(rest, |(_, host)| host);
                format!("{scheme}://{user}:***@{host}")
            }
            _ => self.url.clone(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BROKER_URL)
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("url", &self.redacted_url())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub orders: String,
    pub notifications: String,
    pub history: String,
    pub dead_letters: String,
}

impl QueueNames {
    pub fn all(&self) -> [&str; 4] {
        [
            &self.orders,
            &self.notifications,
            &self.history,
            &self.dead_letters,
        ]
    }
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            orders: DEFAULT_ORDER_QUEUE.to_string(),
            notifications: DEFAULT_NOTIFICATION_QUEUE.to_string(),
            history: DEFAULT_HISTORY_QUEUE.to_string(),
            dead_letters: DEFAULT_DEAD_LETTER_QUEUE.to_string(),
        }
    }
}

/// Delay that doubles per attempt, starting at `initial_delay`, capped at
/// `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    /// Delay before attempt number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub consumer_tag: String,
    /// Messages processed at once; also the partition count when
    /// `partition_by_order` is set.
    pub concurrency: usize,
    /// Deliveries allowed before a message that keeps failing payment is
    /// dead-lettered.
    pub max_deliveries: u32,
    pub prefetch: u16,
    pub partition_by_order: bool,
    /// Wait before requeueing a message the dead-letter queue refused, keyed
    /// on its delivery count.
    pub park_retry: Backoff,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_tag: "settlement".to_string(),
            concurrency: 8,
            max_deliveries: 5,
            prefetch: 16,
            partition_by_order: false,
            park_retry: Backoff {
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(5),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_channels: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_channels: 4 }
    }
}

/// Exponential backoff used when the service restarts after a broker failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` restarts forever.
    pub max_restarts: Option<u32>,
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Backoff {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
        }
        .delay_for(attempt)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_restarts.is_none_or(|max| attempt < max)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_restarts: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettlementConfig {
    pub broker: BrokerConfig,
    pub queues: QueueNames,
    pub consumer: ConsumerConfig,
    pub pool: PoolConfig,
    pub restart: RestartPolicy,
}

impl SettlementConfig {
    pub fn validate(&self) -> Result<()> {
        if self.broker.scheme().is_empty() {
            return Err(PipelineError::Configuration(format!(
                "broker url '{}' has no scheme",
                self.broker.redacted_url()
            )));
        }
        let names = self.queues.all();
        if names.iter().any(|name| name.trim().is_empty()) {
            return Err(PipelineError::Configuration(
                "queue names must not be empty".to_string(),
            ));
        }
        for (i, name) in names.iter().enumerate() {
            if names[i + 1..].contains(name) {
                return Err(PipelineError::Configuration(format!(
                    "queue '{name}' is configured for more than one destination"
                )));
            }
        }
        if self.consumer.concurrency == 0 {
            return Err(PipelineError::Configuration(
                "consumer concurrency must be at least 1".to_string(),
            ));
        }
        if self.consumer.max_deliveries == 0 {
            return Err(PipelineError::Configuration(
                "max deliveries must be at least 1".to_string(),
            ));
        }
        if self.pool.max_channels == 0 {
            return Err(PipelineError::Configuration(
                "channel pool needs at least one channel".to_string(),
            ));
        }
        Ok(())
    }
}
