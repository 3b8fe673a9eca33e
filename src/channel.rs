//! Outbound channel seam.
//!
//! The engine never talks to the messaging provider directly; it goes
//! through [`OutboundChannel`], whose implementations must map the
//! provider's error taxonomy onto [`SendError`] so the worker's retry
//! policy can route every outcome into exactly one bucket.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::campaign::{AudienceSnapshot, DeliverySummary};
use crate::domain::delivery::DeliveryJob;
use crate::error::SendError;

/// Campaign-completed summary sent to the owning seller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionNotice {
    /// Completed campaign.
    pub campaign_id: i64,
    /// Shop display name for the notice text.
    pub shop_name: String,
    /// Final delivery counters.
    pub summary: DeliverySummary,
    /// Live subscription counts taken when the notice was built.
    pub audience: AudienceSnapshot,
}

/// Boundary to the messaging provider.
#[async_trait]
pub trait OutboundChannel: Send + Sync + std::fmt::Debug {
    /// Sends one campaign message (text or photo, with an action button)
    /// to the job's recipient. Returns the channel-side message ID.
    ///
    /// # Errors
    ///
    /// Returns a [`SendError`] classified into the worker's retry buckets.
    async fn send_campaign_message(&self, job: &DeliveryJob) -> Result<i64, SendError>;

    /// Sends the campaign-completed notice to a seller's chat.
    ///
    /// # Errors
    ///
    /// Returns a [`SendError`]; the completion pass retries on the next
    /// tick, so any variant simply delays the notice.
    async fn send_completion_notice(
        &self,
        seller_chat_id: i64,
        notice: &CompletionNotice,
    ) -> Result<(), SendError>;
}

/// Channel that logs instead of delivering. Used by the worker binary
/// until it is wired to a real provider, and for smoke runs.
#[derive(Debug, Default)]
pub struct DryRunChannel {
    next_message_id: AtomicI64,
}

impl DryRunChannel {
    /// Creates a new dry-run channel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboundChannel for DryRunChannel {
    async fn send_campaign_message(&self, job: &DeliveryJob) -> Result<i64, SendError> {
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            delivery_id = job.delivery_id,
            campaign_id = job.campaign_id,
            chat_id = job.recipient_chat_id,
            message_id,
            "dry-run: campaign message not delivered"
        );
        Ok(message_id)
    }

    async fn send_completion_notice(
        &self,
        seller_chat_id: i64,
        notice: &CompletionNotice,
    ) -> Result<(), SendError> {
        tracing::info!(
            campaign_id = notice.campaign_id,
            seller_chat_id,
            sent = notice.summary.sent,
            failed = notice.summary.failed,
            blocked = notice.summary.blocked,
            not_delivered = notice.summary.not_delivered(),
            "dry-run: completion notice not delivered"
        );
        Ok(())
    }
}
