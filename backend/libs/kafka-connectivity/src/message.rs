//! Broker records and the protocol-neutral message envelope.

use rdkafka::message::{Headers, Message};
use std::fmt;

use crate::headers::{self, MessageHeaders};

/// Represents a topic-partition pair
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Owned copy of one consumed broker record
#[derive(Debug, Clone, PartialEq)]
pub struct KafkaRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    /// Broker timestamp in epoch milliseconds
    pub timestamp: Option<i64>,
    pub headers: Vec<(String, Option<Vec<u8>>)>,
}

impl KafkaRecord {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            payload: None,
            timestamp: None,
            headers: Vec::new(),
        }
    }

    /// Copy everything the pipeline needs out of a client-owned message
    pub fn from_message<M: Message>(message: &M) -> Self {
        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|header| (header.key.to_string(), header.value.map(<[u8]>::to_vec)))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
            timestamp: message.timestamp().to_millis(),
            headers,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((key.into(), Some(value.into())));
        self
    }

    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Key decoded as UTF-8, lossy
    pub fn key_string(&self) -> Option<String> {
        self.key
            .as_deref()
            .map(|key| String::from_utf8_lossy(key).into_owned())
    }

    /// Headers decoded as UTF-8; headers without value map to an empty string
    pub fn string_headers(&self) -> MessageHeaders {
        self.headers
            .iter()
            .map(|(key, value)| {
                let value = value
                    .as_deref()
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .unwrap_or_default();
                (key.clone(), value)
            })
            .collect()
    }
}

/// Protocol-neutral envelope handed to the downstream sink and accepted by the publisher
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalMessage {
    pub headers: MessageHeaders,
    pub text_payload: Option<String>,
    pub bytes_payload: Option<Vec<u8>>,
    /// Address the message was consumed from
    pub source_address: Option<String>,
    pub authorization_context: Vec<String>,
    /// Address responses to this message should be published to
    pub reply_target: Option<String>,
}

impl ExternalMessage {
    pub fn new(headers: MessageHeaders) -> Self {
        Self {
            headers,
            ..Default::default()
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text_payload = Some(text.into());
        self
    }

    pub fn with_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.bytes_payload = Some(bytes.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.header(headers::CORRELATION_ID)
    }

    /// Raw payload bytes, preferring the byte representation over the text one
    pub fn payload_bytes(&self) -> Option<&[u8]> {
        self.bytes_payload
            .as_deref()
            .or_else(|| self.text_payload.as_deref().map(str::as_bytes))
    }
}
