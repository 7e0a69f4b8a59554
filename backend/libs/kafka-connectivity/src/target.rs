//! Publish target addresses of the form `topic[/key][#partition]`.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigurationError;

const MAX_TOPIC_LENGTH: usize = 249;
const KEY_SEPARATOR: char = '/';
const PARTITION_SEPARATOR: char = '#';

/// Resolved destination of an outbound message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublishTarget {
    pub topic: String,
    pub key: Option<String>,
    pub partition: Option<i32>,
}

impl PublishTarget {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            partition: None,
        }
    }

    /// Parse an address.
    ///
    /// A key takes the entire remainder after the first `/`, so `events/a#1` has key `a#1`
    /// and no partition. A trailing separator without value means "no key" or "no partition".
    pub fn parse(address: &str) -> Result<Self, ConfigurationError> {
        if let Some((topic, key)) = address.split_once(KEY_SEPARATOR) {
            validate_topic(address, topic)?;
            return Ok(Self {
                topic: topic.to_string(),
                key: (!key.is_empty()).then(|| key.to_string()),
                partition: None,
            });
        }

        if let Some((topic, partition)) = address.split_once(PARTITION_SEPARATOR) {
            validate_topic(address, topic)?;
            return Ok(Self {
                topic: topic.to_string(),
                key: None,
                partition: parse_partition(address, partition)?,
            });
        }

        validate_topic(address, address)?;
        Ok(Self::new(address))
    }
}

fn validate_topic(address: &str, topic: &str) -> Result<(), ConfigurationError> {
    if topic.is_empty() {
        return Err(ConfigurationError::invalid_target(address, "topic is empty"));
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(ConfigurationError::invalid_target(
            address,
            format!("topic exceeds {} characters", MAX_TOPIC_LENGTH),
        ));
    }
    if let Some(invalid) = topic
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(ConfigurationError::invalid_target(
            address,
            format!("invalid character '{}' in topic", invalid),
        ));
    }
    Ok(())
}

fn parse_partition(address: &str, partition: &str) -> Result<Option<i32>, ConfigurationError> {
    if partition.is_empty() {
        return Ok(None);
    }
    // `i32::from_str` accepts a leading '+', which is not part of the grammar
    if !partition.chars().all(|c| c.is_ascii_digit()) {
        return Err(ConfigurationError::invalid_target(
            address,
            format!("partition '{}' is not a non-negative integer", partition),
        ));
    }
    partition.parse::<i32>().map(Some).map_err(|e| {
        ConfigurationError::invalid_target(address, format!("partition out of range: {}", e))
    })
}

impl FromStr for PublishTarget {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PublishTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.topic)?;
        if let Some(key) = &self.key {
            write!(f, "{}{}", KEY_SEPARATOR, key)?;
        } else if let Some(partition) = self.partition {
            write!(f, "{}{}", PARTITION_SEPARATOR, partition)?;
        }
        Ok(())
    }
}
