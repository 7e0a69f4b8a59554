//! Header names understood by the connectivity layer.

use std::collections::HashMap;

/// Headers travelling with inbound and outbound messages
pub type MessageHeaders = HashMap<String, String>;

pub const CORRELATION_ID: &str = "correlation-id";
pub const DEVICE_ID: &str = "device_id";
pub const CONTENT_TYPE: &str = "content-type";

/// Epoch milliseconds at which the message was created
pub const CREATION_TIME: &str = "creation-time";
/// Time to live in milliseconds, relative to `creation-time`
pub const TTL: &str = "ttl";

/// Comma-separated acknowledgement labels requested by the sender
pub const REQUESTED_ACKS: &str = "requested-acks";
/// Address acknowledgements are routed back to
pub const REPLY_TO: &str = "reply-to";

pub const KAFKA_TOPIC: &str = "kafka.topic";
pub const KAFKA_KEY: &str = "kafka.key";
pub const KAFKA_TIMESTAMP: &str = "kafka.timestamp";

/// Parses the `requested-acks` header into its labels
pub fn requested_acks(headers: &MessageHeaders) -> Vec<String> {
    headers
        .get(REQUESTED_ACKS)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_acks_parsing() {
        let mut headers = MessageHeaders::new();
        assert!(requested_acks(&headers).is_empty());

        headers.insert(
            REQUESTED_ACKS.to_string(),
            " twin-persisted, kafka:ack ,,".to_string(),
        );
        assert_eq!(
            requested_acks(&headers),
            vec!["twin-persisted".to_string(), "kafka:ack".to_string()]
        );
    }
}
