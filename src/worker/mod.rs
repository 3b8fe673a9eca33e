//! The delivery worker: lease → send → classify, plus the completion pass.
//!
//! The loop never terminates and never panics on infrastructure errors;
//! a failed tick is logged and retried after the idle interval. Several
//! worker processes may run against the same database — the lease's
//! `SKIP LOCKED` selection keeps them from double-claiming rows.

pub mod backoff;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::channel::{CompletionNotice, OutboundChannel};
use crate::domain::delivery::DeliveryJob;
use crate::error::{SendError, StoreError};
use crate::store::Store;

pub use backoff::retry_delay;

/// Tuning knobs for the worker loop.
///
/// Passed explicitly into [`Worker::new`] so tests can override any knob
/// without touching ambient globals.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum deliveries leased per tick.
    pub batch_size: i64,
    /// How long a leased row stays invisible before it becomes eligible
    /// again (crash-recovery window).
    pub lease: Duration,
    /// Global outbound rate limit, messages per second across the batch.
    pub max_sends_per_second: u32,
    /// Backoff floor for transient failures.
    pub backoff_base: Duration,
    /// Backoff ceiling for transient failures.
    pub backoff_max: Duration,
    /// Sleep between ticks when no deliveries were due.
    pub idle_tick: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            lease: Duration::from_secs(300),
            max_sends_per_second: 25,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(600),
            idle_tick: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    /// Minimum gap between two sends under the global rate limit.
    #[must_use]
    pub fn send_gap(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.max_sends_per_second.max(1)))
    }
}

/// Drains the delivery queue and closes out completed campaigns.
#[derive(Debug)]
pub struct Worker {
    store: Arc<dyn Store>,
    channel: Arc<dyn OutboundChannel>,
    config: WorkerConfig,
}

impl Worker {
    /// Creates a worker over the given store and outbound channel.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        channel: Arc<dyn OutboundChannel>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            channel,
            config,
        }
    }

    /// Runs the loop forever: lease a batch, send it under the rate
    /// limit, give the completion detector a turn, sleep when idle.
    pub async fn run(&self) {
        tracing::info!(
            batch_size = self.config.batch_size,
            lease_secs = self.config.lease.as_secs(),
            max_sends_per_second = self.config.max_sends_per_second,
            "worker started"
        );
        loop {
            match self.tick().await {
                Ok(0) => sleep(self.config.idle_tick).await,
                Ok(processed) => {
                    tracing::debug!(processed, "tick finished");
                }
                Err(e) => {
                    tracing::error!(error = %e, "tick failed; retrying after idle interval");
                    sleep(self.config.idle_tick).await;
                }
            }
        }
    }

    /// One pass: lease due deliveries, send each, run the completion
    /// pass. Returns the number of jobs processed.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the store is unavailable; leased but
    /// unresolved rows simply reappear once their lease expires.
    pub async fn tick(&self) -> Result<usize, StoreError> {
        let jobs = self
            .store
            .lease_due(self.config.batch_size, self.config.lease)
            .await?;

        let gap = self.config.send_gap();
        for (i, job) in jobs.iter().enumerate() {
            if i > 0 {
                sleep(gap).await;
            }
            self.process(job).await?;
        }

        self.finalize_and_notify().await?;
        Ok(jobs.len())
    }

    /// Sends one leased job and routes the outcome into exactly one of
    /// the four queue actions.
    async fn process(&self, job: &DeliveryJob) -> Result<(), StoreError> {
        match self.channel.send_campaign_message(job).await {
            Ok(message_id) => {
                self.store
                    .mark_sent(job.delivery_id, job.campaign_id, message_id)
                    .await?;
                tracing::debug!(delivery_id = job.delivery_id, message_id, "delivery sent");
            }
            Err(SendError::RateLimited { retry_after_secs }) => {
                // The channel named its own delay; do not count this
                // against the backoff budget.
                let delay = Duration::from_secs(u64::from(retry_after_secs));
                self.store
                    .reschedule(job.delivery_id, delay, "rate limited by channel")
                    .await?;
                tracing::debug!(
                    delivery_id = job.delivery_id,
                    retry_after_secs,
                    "delivery rate limited"
                );
            }
            Err(e @ SendError::Blocked(_)) => {
                self.store
                    .mark_blocked(job.delivery_id, job.campaign_id, &e.to_string())
                    .await?;
                tracing::debug!(delivery_id = job.delivery_id, "recipient blocked sender");
            }
            Err(e @ SendError::BadRequest(_)) => {
                self.store
                    .mark_failed(job.delivery_id, job.campaign_id, &e.to_string())
                    .await?;
                tracing::debug!(delivery_id = job.delivery_id, "delivery failed permanently");
            }
            Err(e @ SendError::Transient(_)) => {
                let attempt = u32::try_from(job.attempt).unwrap_or(1);
                let delay =
                    retry_delay(attempt, self.config.backoff_base, self.config.backoff_max);
                self.store
                    .reschedule(job.delivery_id, delay, &e.to_string())
                    .await?;
                tracing::debug!(
                    delivery_id = job.delivery_id,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "delivery rescheduled"
                );
            }
        }
        Ok(())
    }

    /// Promotes drained campaigns to `completed` and delivers one notice
    /// per campaign to the owning seller, at least once.
    async fn finalize_and_notify(&self) -> Result<(), StoreError> {
        let flipped = self.store.finalize_completed().await?;
        if flipped > 0 {
            tracing::info!(flipped, "campaigns completed");
        }

        for completed in self.store.unnotified_completed().await? {
            let audience = self.store.audience_snapshot(completed.shop_id).await?;
            let notice = CompletionNotice {
                campaign_id: completed.campaign_id,
                shop_name: completed.shop_name.clone(),
                summary: completed.summary,
                audience,
            };
            match self
                .channel
                .send_completion_notice(completed.seller_chat_id, &notice)
                .await
            {
                // Flag only after a confirmed send: a crash in between
                // duplicates the notice on the next pass rather than
                // silently dropping it.
                Ok(()) => {
                    self.store
                        .mark_completion_notified(completed.campaign_id)
                        .await?;
                    tracing::info!(
                        campaign_id = completed.campaign_id,
                        sent = completed.summary.sent,
                        failed = completed.summary.failed,
                        blocked = completed.summary.blocked,
                        "completion notice delivered"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        campaign_id = completed.campaign_id,
                        error = %e,
                        "completion notice failed; will retry"
                    );
                }
            }
        }
        Ok(())
    }
}
