//! The outbound seam: whatever actually talks to the SMS provider.

use crate::error::SendError;
use crate::job::{SendResponse, SmsMessage};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Sends one message. Implemented by the provider client the caller supplies.
#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, message: &SmsMessage) -> Result<SendResponse, SendError>;
}

/// Logs each message instead of sending it, after an optional simulated latency.
#[derive(Debug, Clone, Default)]
pub struct DryRunSender {
    latency: Duration,
}

impl DryRunSender {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl SmsSender for DryRunSender {
    async fn send(&self, message: &SmsMessage) -> Result<SendResponse, SendError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let id = Uuid::new_v4().to_string();
        info!(
            message_id = %id,
            from = %message.from,
            to = %message.to,
            chars = message.text.chars().count(),
            "Dry run: message not sent"
        );

        Ok(SendResponse {
            id: id.clone(),
            raw: serde_json::json!({
                "message-count": "1",
                "messages": [{ "to": message.to, "message-id": id, "status": "0" }],
            }),
        })
    }
}
