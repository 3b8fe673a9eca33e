//! Delivery queue rows and the denormalized job records handed to workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound for stored `last_error` text.
pub const LAST_ERROR_MAX_LEN: usize = 5000;

/// Status of a single (campaign, customer) delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting to be sent (or leased and in flight).
    Pending,
    /// Delivered; `channel_message_id` is set.
    Sent,
    /// Recipient blocked the sender. Terminal.
    Blocked,
    /// Bad request / invalid chat. Terminal.
    Failed,
}

impl DeliveryStatus {
    /// Stable string form used in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        }
    }

    /// Parses the database string form. Returns `None` for unknown values.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "blocked" => Some(Self::Blocked),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// A terminal row never regresses back to `pending`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery row: a unit of work sending one campaign to one customer.
///
/// Unique on (`campaign_id`, `customer_id`), which makes the start fan-out
/// idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    /// Row ID.
    pub id: i64,
    /// Parent campaign.
    pub campaign_id: i64,
    /// Recipient customer.
    pub customer_id: i64,
    /// Current status.
    pub status: DeliveryStatus,
    /// Attempts made so far (bumped at lease time).
    pub attempt_count: i32,
    /// When the row next becomes eligible for leasing.
    pub next_attempt_at: DateTime<Utc>,
    /// When the row reached a terminal status.
    pub sent_at: Option<DateTime<Utc>>,
    /// Last send error, truncated to [`LAST_ERROR_MAX_LEN`].
    pub last_error: Option<String>,
    /// Channel-side message ID for sent rows.
    pub channel_message_id: Option<i64>,
}

/// A leased delivery, denormalized so the send step needs no further reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryJob {
    /// Delivery row ID.
    pub delivery_id: i64,
    /// Parent campaign.
    pub campaign_id: i64,
    /// Recipient customer.
    pub customer_id: i64,
    /// Attempt number this lease represents (post-increment).
    pub attempt: i32,
    /// Channel address of the recipient.
    pub recipient_chat_id: i64,
    /// Campaign message text.
    pub text: String,
    /// Action button caption.
    pub button_title: String,
    /// Action button URL.
    pub url: String,
    /// Optional photo reference.
    pub photo_ref: Option<String>,
    /// Shop display name.
    pub shop_name: String,
}

/// Truncates channel error text to [`LAST_ERROR_MAX_LEN`] characters.
#[must_use]
pub fn truncate_error(error: &str) -> String {
    match error.char_indices().nth(LAST_ERROR_MAX_LEN) {
        None => error.to_string(),
        Some((boundary, _)) => error.get(..boundary).unwrap_or_default().to_string(),
    }
}
