//! Push delivery.
//!
//! [`PushTransport`] delivers one payload to one subscription and reports
//! whether a failure is worth retrying. The scheduler owns the policy that
//! follows (pruning dead endpoints, leaving stages unmarked on transient
//! failures).

pub mod payload;
pub mod recording;
pub mod webpush;

use async_trait::async_trait;

use crate::scheduler::tasks::PushSubscription;

pub use payload::{NotificationContent, NotificationPayload, PayloadStyle};
pub use recording::{RecordedPush, RecordingTransport};
pub use webpush::{PreparedPush, WebPushTransport};

/// Why a delivery did not go through.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Endpoint is gone (404/410 or equivalent); the subscription is dead.
    #[error("subscription gone: {reason}")]
    Permanent { reason: String },

    /// The push service rejected our signing credentials for this
    /// subscription. The client re-registers with current keys on its own.
    #[error("push credentials rejected: {reason}")]
    KeyMismatch { reason: String },

    /// Rate limit, server error, network failure or timeout.
    #[error("transient delivery failure: {reason}")]
    Transient { reason: String },
}

impl DeliveryError {
    pub fn permanent(reason: impl Into<String>) -> Self {
        Self::Permanent {
            reason: reason.into(),
        }
    }

    pub fn key_mismatch(reason: impl Into<String>) -> Self {
        Self::KeyMismatch {
            reason: reason.into(),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    /// `true` when the subscription must be removed.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. } | Self::KeyMismatch { .. })
    }
}

/// Delivery channel contract.
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// Stable transport identifier used in logs.
    fn id(&self) -> &'static str;

    /// Deliver `payload` to one subscription.
    async fn send(
        &self,
        subscription: &PushSubscription,
        payload: &NotificationPayload,
    ) -> Result<(), DeliveryError>;
}

/// Classify a push service HTTP response.
///
/// `Ok` for 2xx. 404/410 and any client error mentioning "gone" are
/// permanent; 401/403 mean the VAPID credentials were rejected; everything
/// else (429, 5xx, unexpected statuses) is transient.
pub fn classify_response(status: u16, body: &str) -> Result<(), DeliveryError> {
    if (200..300).contains(&status) {
        return Ok(());
    }

    let detail = summarize_body(body);
    match status {
        404 | 410 => Err(DeliveryError::permanent(format!("HTTP {status}{detail}"))),
        401 | 403 => Err(DeliveryError::key_mismatch(format!("HTTP {status}{detail}"))),
        400..=499 if body.to_ascii_lowercase().contains("gone") => {
            Err(DeliveryError::permanent(format!("HTTP {status}{detail}")))
        }
        _ => Err(DeliveryError::transient(format!("HTTP {status}{detail}"))),
    }
}

fn summarize_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let short: String = trimmed.chars().take(160).collect();
    format!(": {short}")
}
