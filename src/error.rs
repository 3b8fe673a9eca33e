//! Engine error types.
//!
//! Three layers, matching how errors surface:
//!
//! - [`StoreError`] — infrastructure failures from the persistence layer.
//!   Never shown to merchants; the worker logs them and retries next tick.
//! - [`LedgerError`] / [`StartError`] — caller errors surfaced
//!   synchronously to whoever triggers a campaign start. Each variant maps
//!   to a distinct merchant-facing message; none are retried automatically.
//! - [`SendError`] — the outbound channel's error taxonomy, pre-classified
//!   into the retry buckets the worker loop routes on.

use crate::domain::campaign::CampaignStatus;

/// Persistence layer failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying database reported an error.
    #[error("database error: {0}")]
    Database(String),

    /// A row the engine relies on was missing or inconsistent.
    #[error("store invariant violated: {0}")]
    InvariantViolation(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Credit ledger operation failure.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Conditional spend found a balance below the requested amount.
    #[error("insufficient credits for seller {seller_id}")]
    InsufficientCredits {
        /// Seller whose balance was too low.
        seller_id: i64,
    },

    /// The seller has no credit account row.
    #[error("no credit account for seller {seller_id}")]
    AccountMissing {
        /// Seller without an account row.
        seller_id: i64,
    },

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Campaign start failure, surfaced to the merchant-facing caller.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    /// No campaign with this ID belongs to the acting seller.
    #[error("campaign not found")]
    CampaignNotFound,

    /// The campaign is already `sending` or `completed`.
    #[error("campaign already started")]
    CampaignAlreadyStarted,

    /// The campaign is not in the status the start policy requires.
    #[error("campaign cannot be started from status {0}")]
    CampaignInvalidStatus(CampaignStatus),

    /// Credit spend failed; no deliveries were enqueued.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outbound channel send failure, classified at the channel boundary.
///
/// Every error the real channel can produce must map onto exactly one of
/// these variants; the worker's retry policy routes on them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SendError {
    /// The channel asked to retry after an explicit delay.
    #[error("rate limited; retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds the channel asked to wait.
        retry_after_secs: u32,
    },

    /// The recipient blocked the sender. Terminal, never retried.
    #[error("recipient blocked the sender: {0}")]
    Blocked(String),

    /// Invalid chat or malformed request. Terminal, never retried.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Network/server failure or unclassified error. Retried with backoff.
    #[error("transient send failure: {0}")]
    Transient(String),
}
