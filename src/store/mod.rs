//! Persistence layer: credit ledger, campaign store and delivery queue.
//!
//! [`Store`] gathers every atomic operation the engine performs against
//! the database. The production implementation is [`PgStore`] over
//! `sqlx::PgPool`; [`MemoryStore`] backs tests and embedded usage with
//! the same semantics behind one async mutex.
//!
//! Atomicity contract: each trait method is one atomic unit. Composite
//! operations (`start_campaign`) are built from individually atomic,
//! re-entrant steps so a crashed caller can safely retry.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::campaign::{
    AudienceSnapshot, Campaign, CompletedCampaign, StartPolicy,
};
use crate::domain::credit::{CreditReason, CreditTransaction};
use crate::domain::delivery::DeliveryJob;
use crate::error::{LedgerError, StartError, StoreError};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Atomic engine operations over the four engine tables.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Grants `amount` credits to a seller and writes the ledger entry,
    /// in one database transaction. Creates the balance row if missing.
    ///
    /// When `external_charge_id` is given and an entry with that charge
    /// already exists for this seller, the call is a no-op returning the
    /// current balance (safe against payment-provider redelivery).
    ///
    /// Returns the new balance.
    ///
    /// # Errors
    ///
    /// Returns a [`LedgerError`] on store failure; `amount` must be
    /// positive under correct use.
    async fn grant_credits(
        &self,
        seller_id: i64,
        amount: i64,
        reason: CreditReason,
        external_charge_id: Option<&str>,
    ) -> Result<i64, LedgerError>;

    /// Spends one credit for starting `campaign_id`, as a single
    /// conditional update plus the ledger entry in one transaction.
    ///
    /// If a `campaign_send` entry already exists for this campaign the
    /// call is a no-op returning the current balance, which makes a
    /// crashed start retry-safe without double-spending.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InsufficientCredits`] when the balance is
    /// zero, [`LedgerError::AccountMissing`] when the seller has no
    /// balance row.
    async fn spend_credit(&self, seller_id: i64, campaign_id: i64) -> Result<i64, LedgerError>;

    /// Returns the current balance for a seller (0 if no account row).
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    async fn credit_balance(&self, seller_id: i64) -> Result<i64, StoreError>;

    /// Returns all ledger entries for a seller, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    async fn credit_transactions(&self, seller_id: i64)
    -> Result<Vec<CreditTransaction>, StoreError>;

    /// Starts a campaign owned by `seller_id`: guards the status under
    /// `policy`, spends one credit, fans out one pending delivery per
    /// currently-subscribed customer of the campaign's shop, resets the
    /// outcome counters and flips the status to `sending`.
    ///
    /// Returns the number of delivery rows (the audience snapshot size).
    ///
    /// # Errors
    ///
    /// Returns the typed [`StartError`] taxonomy: not-found,
    /// already-started, invalid-status, insufficient credits, or store
    /// failure. On insufficient credits no delivery rows exist.
    async fn start_campaign(
        &self,
        seller_id: i64,
        campaign_id: i64,
        policy: &StartPolicy,
    ) -> Result<i64, StartError>;

    /// Loads one campaign row.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    async fn campaign(&self, campaign_id: i64) -> Result<Option<Campaign>, StoreError>;

    /// Leases up to `batch_size` due deliveries whose campaign is still
    /// `sending`, FIFO by (`next_attempt_at`, `id`), skipping rows locked
    /// by a concurrent leaser. In the same transaction bumps
    /// `attempt_count` and pushes `next_attempt_at` forward by `lease`,
    /// so a crashed worker's rows become eligible again automatically.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    async fn lease_due(
        &self,
        batch_size: i64,
        lease: Duration,
    ) -> Result<Vec<DeliveryJob>, StoreError>;

    /// Marks a pending delivery as sent and bumps the campaign's
    /// `sent_count`. A row already in a terminal status is left untouched.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    async fn mark_sent(
        &self,
        delivery_id: i64,
        campaign_id: i64,
        channel_message_id: i64,
    ) -> Result<(), StoreError>;

    /// Marks a pending delivery as blocked and bumps `blocked_count`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    async fn mark_blocked(
        &self,
        delivery_id: i64,
        campaign_id: i64,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Marks a pending delivery as failed and bumps `failed_count`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    async fn mark_failed(
        &self,
        delivery_id: i64,
        campaign_id: i64,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Returns a leased delivery to `pending` with `next_attempt_at`
    /// pushed `delay` into the future, recording the truncated error.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    async fn reschedule(
        &self,
        delivery_id: i64,
        delay: Duration,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Atomically flips every `sending` campaign with no remaining
    /// pending deliveries to `completed`. Returns how many were flipped.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    async fn finalize_completed(&self) -> Result<u64, StoreError>;

    /// Returns completed campaigns whose seller notice has not been
    /// confirmed yet, with owner and counter data for the notice.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    async fn unnotified_completed(&self) -> Result<Vec<CompletedCampaign>, StoreError>;

    /// Records that the completion notice for a campaign was delivered.
    /// Called only after the channel send succeeded.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    async fn mark_completion_notified(&self, campaign_id: i64) -> Result<(), StoreError>;

    /// Live subscription counts for a shop, for the completion notice.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on database failure.
    async fn audience_snapshot(&self, shop_id: i64) -> Result<AudienceSnapshot, StoreError>;
}
