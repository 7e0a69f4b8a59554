//! Connectivity settings
//!
//! Broker connection properties stay in an opaque `rdkafka::ClientConfig`; these settings
//! only cover how streams and the publisher behave.

use std::path::Path;
use std::time::Duration;

use resilience::{ExponentialBackoff, RestartBackoff};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ConfigurationError;
use crate::publisher::PublisherSettings;
use crate::stream::{DeliveryMode, StreamSettings};

const ENV_PREFIX: &str = "KAFKA_CONNECTIVITY";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, Deserialize, Serialize, Validate)]
pub struct ConnectivitySettings {
    #[serde(default)]
    #[validate(nested)]
    pub consumer: ConsumerSettings,

    #[serde(default)]
    #[validate(nested)]
    pub producer: ProducerSettings,
}

/// Consumer stream configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ConsumerSettings {
    #[serde(default)]
    pub delivery_mode: DeliveryMode,

    /// Records processed concurrently
    #[validate(range(min = 1, max = 10000))]
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,

    /// Capacity of the queue between the broker poller and the stream
    #[validate(range(min = 1, max = 100000))]
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,

    #[validate(range(min = 1))]
    #[serde(default = "default_restart_min_backoff_ms")]
    pub restart_min_backoff_ms: u64,

    #[validate(range(min = 1))]
    #[serde(default = "default_restart_max_backoff_ms")]
    pub restart_max_backoff_ms: u64,

    #[validate(range(min = 0.0, max = 10.0))]
    #[serde(default = "default_restart_random_factor")]
    pub restart_random_factor: f64,
}

fn default_max_inflight() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    64
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_restart_min_backoff_ms() -> u64 {
    1_000
}

fn default_restart_max_backoff_ms() -> u64 {
    30_000
}

fn default_restart_random_factor() -> f64 {
    0.2
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            delivery_mode: DeliveryMode::default(),
            max_inflight: default_max_inflight(),
            queue_capacity: default_queue_capacity(),
            drain_timeout_ms: default_drain_timeout_ms(),
            restart_min_backoff_ms: default_restart_min_backoff_ms(),
            restart_max_backoff_ms: default_restart_max_backoff_ms(),
            restart_random_factor: default_restart_random_factor(),
        }
    }
}

impl ConsumerSettings {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            max_inflight: self.max_inflight,
            drain_timeout: self.drain_timeout(),
        }
    }

    pub fn backoff_policy(&self) -> Result<ExponentialBackoff, ConfigurationError> {
        Ok(ExponentialBackoff::new(
            Duration::from_millis(self.restart_min_backoff_ms),
            Duration::from_millis(self.restart_max_backoff_ms),
            self.restart_random_factor,
        )?)
    }

    pub fn restart_backoff(&self) -> Result<RestartBackoff, ConfigurationError> {
        self.backoff_policy().map(RestartBackoff::new)
    }
}

/// Publisher configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ProducerSettings {
    /// Messages that may wait for a send before new ones are rejected
    #[validate(range(min = 1, max = 100000))]
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    #[validate(range(min = 1, max = 1000))]
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Local queue timeout of a single send
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    #[validate(length(min = 1, max = 255))]
    #[serde(default = "default_ack_label")]
    pub ack_label: String,
}

fn default_queue_size() -> usize {
    1000
}

fn default_parallelism() -> usize {
    10
}

fn default_send_timeout_ms() -> u64 {
    30_000
}

fn default_ack_label() -> String {
    "kafka:published".to_string()
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            parallelism: default_parallelism(),
            send_timeout_ms: default_send_timeout_ms(),
            ack_label: default_ack_label(),
        }
    }
}

impl ProducerSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn publisher_settings(&self) -> PublisherSettings {
        PublisherSettings {
            queue_size: self.queue_size,
            parallelism: self.parallelism,
            ack_label: self.ack_label.clone(),
        }
    }
}

impl ConnectivitySettings {
    /// Load settings.
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. Configuration file (if given and present)
    /// 3. Environment variables, e.g. `KAFKA_CONNECTIVITY__CONSUMER__MAX_INFLIGHT=32`
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigurationError> {
        Self::load_from(config_path, environment())
    }

    fn load_from(
        config_path: Option<&Path>,
        environment: config::Environment,
    ) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            if path.exists() {
                builder = builder.add_source(config::File::from(path));
            }
        }

        let settings: ConnectivitySettings = builder
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        settings.validate_settings()?;
        Ok(settings)
    }

    /// Field ranges plus the backoff bounds
    pub fn validate_settings(&self) -> Result<(), ConfigurationError> {
        self.validate()?;
        self.consumer.backoff_policy()?;
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
}
