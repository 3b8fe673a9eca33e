//! Campaign model and status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StartError;

/// Lifecycle status of a campaign.
///
/// Transitions are one-directional:
/// `draft → paid → sending → completed`, with `canceled` reachable from
/// `draft` and `paid` only. See [`CampaignStatus::can_transition_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    /// Authored but not paid for.
    Draft,
    /// Payment confirmed; eligible for start.
    Paid,
    /// Fan-out done, deliveries in flight.
    Sending,
    /// No pending deliveries remain.
    Completed,
    /// Withdrawn before start.
    Canceled,
}

impl CampaignStatus {
    /// Stable string form used in the database and in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Paid => "paid",
            Self::Sending => "sending",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
        }
    }

    /// Parses the database string form. Returns `None` for unknown values.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "paid" => Some(Self::Paid),
            "sending" => Some(Self::Sending),
            "completed" => Some(Self::Completed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Whether moving from `self` to `next` is an allowed transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Paid)
                | (Self::Draft, Self::Canceled)
                | (Self::Paid, Self::Sending)
                | (Self::Paid, Self::Canceled)
                | (Self::Sending, Self::Completed)
        )
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy knob for which status a campaign must hold before start.
///
/// The default requires exactly [`CampaignStatus::Paid`]. Deployments that
/// allow starting unpaid drafts (e.g. internal test rigs) can loosen this
/// without touching the state machine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartPolicy {
    /// The only status from which a start is accepted.
    pub required_status: CampaignStatus,
}

impl Default for StartPolicy {
    fn default() -> Self {
        Self {
            required_status: CampaignStatus::Paid,
        }
    }
}

impl StartPolicy {
    /// Validates that a campaign in `status` may be started under this policy.
    ///
    /// # Errors
    ///
    /// Returns [`StartError::CampaignAlreadyStarted`] for `sending` and
    /// `completed`, and [`StartError::CampaignInvalidStatus`] for any other
    /// status that is not the required predecessor.
    pub fn check(&self, status: CampaignStatus) -> Result<(), StartError> {
        match status {
            CampaignStatus::Sending | CampaignStatus::Completed => {
                Err(StartError::CampaignAlreadyStarted)
            }
            s if s == self.required_status => Ok(()),
            s => Err(StartError::CampaignInvalidStatus(s)),
        }
    }
}

/// A campaign row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    /// Row ID.
    pub id: i64,
    /// Shop whose subscribers receive the campaign.
    pub shop_id: i64,
    /// Lifecycle status.
    pub status: CampaignStatus,
    /// Message text shown to recipients.
    pub text: String,
    /// Caption of the action button.
    pub button_title: String,
    /// URL the action button leads to.
    pub url: String,
    /// Optional channel-side photo reference.
    pub photo_ref: Option<String>,
    /// Price paid for the campaign, in minor currency units.
    pub price_minor: i64,
    /// ISO currency code of the price.
    pub currency: String,
    /// Delivery rows created at start (audience snapshot size).
    pub total_recipients: i64,
    /// Deliveries resolved as sent.
    pub sent_count: i64,
    /// Deliveries resolved as failed (bad request).
    pub failed_count: i64,
    /// Deliveries resolved as blocked by the recipient.
    pub blocked_count: i64,
    /// Whether the completion notice was delivered to the seller.
    pub completed_notified: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Payment confirmation timestamp, if paid.
    pub paid_at: Option<DateTime<Utc>>,
}

/// Delivery outcome counters for a finished (or running) campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverySummary {
    /// Audience snapshot size at start.
    pub total_recipients: i64,
    /// Successfully delivered.
    pub sent: i64,
    /// Permanently failed (bad request / invalid chat).
    pub failed: i64,
    /// Recipient blocked the sender.
    pub blocked: i64,
}

impl DeliverySummary {
    /// Recipients that did not receive the message (`total − sent`).
    #[must_use]
    pub const fn not_delivered(&self) -> i64 {
        self.total_recipients - self.sent
    }
}

/// Live subscription counts for a shop, taken when the notice is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudienceSnapshot {
    /// All customers that ever interacted with the shop.
    pub total: i64,
    /// Currently subscribed.
    pub subscribed: i64,
    /// Currently unsubscribed.
    pub unsubscribed: i64,
}

/// A completed campaign pending (or eligible for) seller notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedCampaign {
    /// Campaign row ID.
    pub campaign_id: i64,
    /// Shop the campaign belonged to.
    pub shop_id: i64,
    /// Shop display name, for the notice text.
    pub shop_name: String,
    /// Owning seller.
    pub seller_id: i64,
    /// Channel address of the owning seller.
    pub seller_chat_id: i64,
    /// Final delivery counters.
    pub summary: DeliverySummary,
}
