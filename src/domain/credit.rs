//! Seller credit balance and the append-only transaction ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a ledger transaction was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditReason {
    /// One-time balance granted on first signup.
    FreeSignup,
    /// Manual grant by an operator.
    AdminGrant,
    /// Credits bought through the payment provider.
    CreditsPurchase,
    /// One credit consumed by starting a campaign.
    CampaignSend,
}

impl CreditReason {
    /// Stable string form used in the database.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FreeSignup => "free_signup",
            Self::AdminGrant => "admin_grant",
            Self::CreditsPurchase => "credits_purchase",
            Self::CampaignSend => "campaign_send",
        }
    }

    /// Parses the database string form. Returns `None` for unknown values.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free_signup" => Some(Self::FreeSignup),
            "admin_grant" => Some(Self::AdminGrant),
            "credits_purchase" => Some(Self::CreditsPurchase),
            "campaign_send" => Some(Self::CampaignSend),
            _ => None,
        }
    }
}

impl std::fmt::Display for CreditReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Materialized credit balance for one seller.
///
/// The balance never goes negative and only changes together with a
/// [`CreditTransaction`] row written in the same database transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellerCredit {
    /// Owning seller.
    pub seller_id: i64,
    /// Current balance in whole credits.
    pub balance: i64,
    /// Last balance change.
    pub updated_at: DateTime<Utc>,
}

/// One append-only ledger entry.
///
/// Invariant: for every seller, the sum of `delta` over all entries
/// equals the current [`SellerCredit::balance`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Row ID.
    pub id: i64,
    /// Owning seller.
    pub seller_id: i64,
    /// Signed balance change.
    pub delta: i64,
    /// Why the change happened.
    pub reason: CreditReason,
    /// Balance snapshot after applying `delta`.
    pub balance_after: i64,
    /// Campaign that consumed the credit, for `campaign_send` entries.
    pub campaign_id: Option<i64>,
    /// External payment charge ID, for idempotent `credits_purchase` grants.
    pub external_charge_id: Option<String>,
    /// Entry timestamp.
    pub created_at: DateTime<Utc>,
}
