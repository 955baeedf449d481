//! Notification payloads
//!
//! Every notification carries a typed payload instead of a free-form
//! metadata map. The payload is tagged by `type` and versioned through
//! `schema_version` so consumers can reject shapes they do not know.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use super::NotificationService;

/// Current payload schema version
pub const NOTIFICATION_SCHEMA_VERSION: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotificationError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Action data attached to a notification, one shape per notification type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NotificationPayload {
    PrizeAwarded {
        unit_id: String,
        distribution_id: String,
        amount_sats: u64,
        position: u32,
        transaction_hash: Option<String>,
    },
    CompetitionCompleted {
        unit_id: String,
        unit_name: String,
    },
    ChallengeAccepted {
        unit_id: String,
        accepted_by: String,
    },
    ChallengeDeclined {
        unit_id: String,
        declined_by: String,
    },
}

impl NotificationPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PrizeAwarded { .. } => "prize_awarded",
            Self::CompetitionCompleted { .. } => "competition_completed",
            Self::ChallengeAccepted { .. } => "challenge_accepted",
            Self::ChallengeDeclined { .. } => "challenge_declined",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub payload: NotificationPayload,
    pub schema_version: u16,
}

impl Notification {
    pub fn prize_awarded(
        user_id: &str,
        unit_id: &str,
        unit_name: &str,
        distribution_id: &str,
        amount_sats: u64,
        position: u32,
        transaction_hash: Option<String>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            title: "Prize awarded".to_string(),
            body: format!("You won {} sats in {}", amount_sats, unit_name),
            payload: NotificationPayload::PrizeAwarded {
                unit_id: unit_id.to_string(),
                distribution_id: distribution_id.to_string(),
                amount_sats,
                position,
                transaction_hash,
            },
            schema_version: NOTIFICATION_SCHEMA_VERSION,
        }
    }

    pub fn competition_completed(user_id: &str, unit_id: &str, unit_name: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            title: "Competition completed".to_string(),
            body: format!("{} has finished. Thanks for competing!", unit_name),
            payload: NotificationPayload::CompetitionCompleted {
                unit_id: unit_id.to_string(),
                unit_name: unit_name.to_string(),
            },
            schema_version: NOTIFICATION_SCHEMA_VERSION,
        }
    }

    pub fn challenge_accepted(challenger_id: &str, unit_id: &str, accepted_by: &str) -> Self {
        Self {
            user_id: challenger_id.to_string(),
            title: "Challenge accepted".to_string(),
            body: format!("{} accepted your challenge", accepted_by),
            payload: NotificationPayload::ChallengeAccepted {
                unit_id: unit_id.to_string(),
                accepted_by: accepted_by.to_string(),
            },
            schema_version: NOTIFICATION_SCHEMA_VERSION,
        }
    }

    pub fn challenge_declined(challenger_id: &str, unit_id: &str, declined_by: &str) -> Self {
        Self {
            user_id: challenger_id.to_string(),
            title: "Challenge declined".to_string(),
            body: format!("{} declined your challenge", declined_by),
            payload: NotificationPayload::ChallengeDeclined {
                unit_id: unit_id.to_string(),
                declined_by: declined_by.to_string(),
            },
            schema_version: NOTIFICATION_SCHEMA_VERSION,
        }
    }
}

/// Deliver and log failures; notification errors never reach the caller
pub async fn notify_logged(notifier: &dyn NotificationService, notification: Notification) {
    let user_id = notification.user_id.clone();
    let kind = notification.payload.kind();
    if let Err(e) = notifier.notify(notification).await {
        warn!(user_id = %user_id, kind = kind, error = %e, "Notification not delivered");
    }
}

/// Notifier that only logs; the default when no delivery channel is wired
#[derive(Debug, Default, Clone)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationService for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<(), NotificationError> {
        info!(
            user_id = %notification.user_id,
            kind = notification.payload.kind(),
            "📣 {}",
            notification.title
        );
        Ok(())
    }
}
