use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;

/// Broker-reported metadata of a published record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    pub timestamp: Option<i64>,
    pub serialized_key_size: usize,
    pub serialized_value_size: usize,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// Acknowledgement sent back to the requester of a published message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    pub label: String,
    pub http_status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<serde_json::Value>,
}

impl Acknowledgement {
    pub fn published(
        label: impl Into<String>,
        correlation_id: Option<String>,
        metadata: &RecordMetadata,
    ) -> Self {
        Self {
            label: label.into(),
            http_status: StatusCode::OK.as_u16(),
            correlation_id,
            entity: serde_json::to_value(metadata).ok(),
        }
    }

    pub fn failed(
        label: impl Into<String>,
        status: StatusCode,
        correlation_id: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        Self {
            label: label.into(),
            http_status: status.as_u16(),
            correlation_id,
            entity: Some(json!({
                "status": status.as_u16(),
                "error": status.canonical_reason().unwrap_or("error"),
                "message": message,
            })),
        }
    }

    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn is_success(&self) -> bool {
        self.status().is_success()
    }

    /// Diagnostic message of a negative acknowledgement
    pub fn message(&self) -> Option<&str> {
        self.entity
            .as_ref()
            .and_then(|entity| entity.get("message"))
            .and_then(|message| message.as_str())
    }
}

/// Delivers acknowledgements to the address that asked for them
pub trait AcknowledgementRouter: Send + Sync {
    fn route(&self, requester: &str, acknowledgement: Acknowledgement);
}

impl AcknowledgementRouter for mpsc::UnboundedSender<(String, Acknowledgement)> {
    fn route(&self, requester: &str, acknowledgement: Acknowledgement) {
        if self.send((requester.to_string(), acknowledgement)).is_err() {
            debug!(requester, "Acknowledgement receiver gone");
        }
    }
}
