//! PostgreSQL implementation of the engine store.
//!
//! All composite operations run inside explicit transactions; the
//! delivery queue relies on `FOR UPDATE ... SKIP LOCKED` so multiple
//! worker processes can lease concurrently without blocking each other.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::Store;
use crate::domain::campaign::{
    AudienceSnapshot, Campaign, CampaignStatus, CompletedCampaign, DeliverySummary, StartPolicy,
};
use crate::domain::credit::{CreditReason, CreditTransaction};
use crate::domain::delivery::{DeliveryJob, truncate_error};
use crate::error::{LedgerError, StartError, StoreError};

/// PostgreSQL-backed store using `sqlx::PgPool`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Creates a new store with the given connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Grant attempt that surfaces raw database errors so the caller can
    /// distinguish a unique-violation replay from a real failure.
    async fn try_grant(
        &self,
        seller_id: i64,
        amount: i64,
        reason: CreditReason,
        external_charge_id: Option<&str>,
    ) -> Result<i64, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let balance = sqlx::query_scalar::<_, i64>(
            "INSERT INTO seller_credits (seller_id, balance) VALUES ($1, $2) \
             ON CONFLICT (seller_id) DO UPDATE \
             SET balance = seller_credits.balance + EXCLUDED.balance, updated_at = now() \
             RETURNING balance",
        )
        .bind(seller_id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO credit_transactions \
             (seller_id, delta, reason, balance_after, external_charge_id) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(seller_id)
        .bind(amount)
        .bind(reason.as_str())
        .bind(balance)
        .bind(external_charge_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(balance)
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .is_some_and(|db| db.is_unique_violation())
}

fn parse_campaign_status(raw: &str) -> Result<CampaignStatus, StoreError> {
    CampaignStatus::parse(raw).ok_or_else(|| {
        StoreError::InvariantViolation(format!("unknown campaign status: {raw}"))
    })
}

fn lease_secs(lease: Duration) -> i64 {
    i64::try_from(lease.as_secs()).unwrap_or(i64::MAX)
}

fn delay_secs(delay: Duration) -> i64 {
    i64::try_from(delay.as_secs()).unwrap_or(i64::MAX).max(1)
}

#[async_trait]
impl Store for PgStore {
    async fn grant_credits(
        &self,
        seller_id: i64,
        amount: i64,
        reason: CreditReason,
        external_charge_id: Option<&str>,
    ) -> Result<i64, LedgerError> {
        match self
            .try_grant(seller_id, amount, reason, external_charge_id)
            .await
        {
            Ok(balance) => Ok(balance),
            // The partial unique index on (seller_id, external_charge_id)
            // rejected a replayed grant; the whole transaction rolled back,
            // so the balance is untouched.
            Err(e) if external_charge_id.is_some() && is_unique_violation(&e) => {
                Ok(self.credit_balance(seller_id).await?)
            }
            Err(e) => Err(StoreError::from(e).into()),
        }
    }

    async fn spend_credit(&self, seller_id: i64, campaign_id: i64) -> Result<i64, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        // A crashed start retries this call; the existing campaign_send
        // entry means the credit was already consumed.
        let replayed = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (\
                 SELECT 1 FROM credit_transactions \
                 WHERE seller_id = $1 AND campaign_id = $2 AND reason = 'campaign_send')",
        )
        .bind(seller_id)
        .bind(campaign_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        if replayed {
            let balance = sqlx::query_scalar::<_, i64>(
                "SELECT balance FROM seller_credits WHERE seller_id = $1",
            )
            .bind(seller_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::from)?
            .ok_or(LedgerError::AccountMissing { seller_id })?;
            tx.rollback().await.map_err(StoreError::from)?;
            return Ok(balance);
        }

        // Conditional decrement, not read-then-write: concurrent spends
        // for the same seller cannot both pass the balance guard.
        let balance = sqlx::query_scalar::<_, i64>(
            "UPDATE seller_credits \
             SET balance = balance - 1, updated_at = now() \
             WHERE seller_id = $1 AND balance >= 1 \
             RETURNING balance",
        )
        .bind(seller_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        let Some(balance) = balance else {
            let account_exists = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM seller_credits WHERE seller_id = $1)",
            )
            .bind(seller_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(StoreError::from)?;
            tx.rollback().await.map_err(StoreError::from)?;
            return Err(if account_exists {
                LedgerError::InsufficientCredits { seller_id }
            } else {
                LedgerError::AccountMissing { seller_id }
            });
        };

        sqlx::query(
            "INSERT INTO credit_transactions \
             (seller_id, delta, reason, balance_after, campaign_id) \
             VALUES ($1, -1, 'campaign_send', $2, $3)",
        )
        .bind(seller_id)
        .bind(balance)
        .bind(campaign_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(balance)
    }

    async fn credit_balance(&self, seller_id: i64) -> Result<i64, StoreError> {
        let balance = sqlx::query_scalar::<_, i64>(
            "SELECT balance FROM seller_credits WHERE seller_id = $1",
        )
        .bind(seller_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(balance.unwrap_or(0))
    }

    async fn credit_transactions(
        &self,
        seller_id: i64,
    ) -> Result<Vec<CreditTransaction>, StoreError> {
        let rows = sqlx::query_as::<
            _,
            (
                i64,
                i64,
                i64,
                String,
                i64,
                Option<i64>,
                Option<String>,
                DateTime<Utc>,
            ),
        >(
            "SELECT id, seller_id, delta, reason, balance_after, campaign_id, \
             external_charge_id, created_at \
             FROM credit_transactions WHERE seller_id = $1 ORDER BY id ASC",
        )
        .bind(seller_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(id, seller_id, delta, reason, balance_after, campaign_id, charge, created_at)| {
                    let reason = CreditReason::parse(&reason).ok_or_else(|| {
                        StoreError::InvariantViolation(format!("unknown credit reason: {reason}"))
                    })?;
                    Ok(CreditTransaction {
                        id,
                        seller_id,
                        delta,
                        reason,
                        balance_after,
                        campaign_id,
                        external_charge_id: charge,
                        created_at,
                    })
                },
            )
            .collect()
    }

    async fn start_campaign(
        &self,
        seller_id: i64,
        campaign_id: i64,
        policy: &StartPolicy,
    ) -> Result<i64, StartError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        // Row lock scoped to the acting seller's ownership serializes
        // concurrent starts of the same campaign.
        let campaign = sqlx::query_as::<_, (i64, String)>(
            "SELECT c.shop_id, c.status \
             FROM campaigns c \
             JOIN shops sh ON sh.id = c.shop_id \
             WHERE sh.seller_id = $1 AND c.id = $2 \
             FOR UPDATE OF c",
        )
        .bind(seller_id)
        .bind(campaign_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        let Some((shop_id, raw_status)) = campaign else {
            tx.rollback().await.map_err(StoreError::from)?;
            return Err(StartError::CampaignNotFound);
        };
        policy.check(parse_campaign_status(&raw_status)?)?;

        // Spend one credit, idempotent per campaign (see spend_credit).
        let replayed = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (\
                 SELECT 1 FROM credit_transactions \
                 WHERE seller_id = $1 AND campaign_id = $2 AND reason = 'campaign_send')",
        )
        .bind(seller_id)
        .bind(campaign_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        if !replayed {
            let balance = sqlx::query_scalar::<_, i64>(
                "UPDATE seller_credits \
                 SET balance = balance - 1, updated_at = now() \
                 WHERE seller_id = $1 AND balance >= 1 \
                 RETURNING balance",
            )
            .bind(seller_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StoreError::from)?;

            let Some(balance) = balance else {
                tx.rollback().await.map_err(StoreError::from)?;
                return Err(LedgerError::InsufficientCredits { seller_id }.into());
            };

            sqlx::query(
                "INSERT INTO credit_transactions \
                 (seller_id, delta, reason, balance_after, campaign_id) \
                 VALUES ($1, -1, 'campaign_send', $2, $3)",
            )
            .bind(seller_id)
            .bind(balance)
            .bind(campaign_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
        }

        // Fan-out is an audience snapshot: customers subscribed right now.
        // The unique pair makes a retried start a no-op here.
        sqlx::query(
            "INSERT INTO deliveries (campaign_id, customer_id, status, next_attempt_at) \
             SELECT $1, sc.customer_id, 'pending', now() \
             FROM shop_customers sc \
             WHERE sc.shop_id = $2 AND sc.status = 'subscribed' \
             ON CONFLICT (campaign_id, customer_id) DO NOTHING",
        )
        .bind(campaign_id)
        .bind(shop_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM deliveries WHERE campaign_id = $1",
        )
        .bind(campaign_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        sqlx::query(
            "UPDATE campaigns \
             SET status = 'sending', total_recipients = $2, \
                 sent_count = 0, failed_count = 0, blocked_count = 0 \
             WHERE id = $1",
        )
        .bind(campaign_id)
        .bind(total)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        tracing::info!(campaign_id, seller_id, total_recipients = total, "campaign started");
        Ok(total)
    }

    async fn campaign(&self, campaign_id: i64) -> Result<Option<Campaign>, StoreError> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i64,
                String,
                String,
                String,
                String,
                Option<String>,
                i64,
                String,
                i64,
                i64,
                i64,
                i64,
                bool,
                DateTime<Utc>,
                Option<DateTime<Utc>>,
            ),
        >(
            "SELECT id, shop_id, status, text, button_title, url, photo_ref, \
             price_minor, currency, total_recipients, sent_count, failed_count, \
             blocked_count, completed_notified, created_at, paid_at \
             FROM campaigns WHERE id = $1",
        )
        .bind(campaign_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(
            |(
                id,
                shop_id,
                status,
                text,
                button_title,
                url,
                photo_ref,
                price_minor,
                currency,
                total_recipients,
                sent_count,
                failed_count,
                blocked_count,
                completed_notified,
                created_at,
                paid_at,
            )| {
                Ok(Campaign {
                    id,
                    shop_id,
                    status: parse_campaign_status(&status)?,
                    text,
                    button_title,
                    url,
                    photo_ref,
                    price_minor,
                    currency,
                    total_recipients,
                    sent_count,
                    failed_count,
                    blocked_count,
                    completed_notified,
                    created_at,
                    paid_at,
                })
            },
        )
        .transpose()
    }

    async fn lease_due(
        &self,
        batch_size: i64,
        lease: Duration,
    ) -> Result<Vec<DeliveryJob>, StoreError> {
        if batch_size <= 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<
            _,
            (
                i64,
                i64,
                i64,
                i32,
                i64,
                String,
                String,
                String,
                Option<String>,
                String,
            ),
        >(
            "SELECT d.id, d.campaign_id, d.customer_id, d.attempt_count, \
             cu.chat_id, c.text, c.button_title, c.url, c.photo_ref, sh.name \
             FROM deliveries d \
             JOIN campaigns c ON c.id = d.campaign_id \
             JOIN customers cu ON cu.id = d.customer_id \
             JOIN shops sh ON sh.id = c.shop_id \
             WHERE d.status = 'pending' \
               AND d.next_attempt_at <= now() \
               AND c.status = 'sending' \
             ORDER BY d.next_attempt_at ASC, d.id ASC \
             FOR UPDATE OF d SKIP LOCKED \
             LIMIT $1",
        )
        .bind(batch_size)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        // The lease: bump the attempt and push the due time forward in the
        // same transaction as the selection. A worker that crashes mid-send
        // leaves a row that becomes eligible again on its own.
        let ids: Vec<i64> = rows.iter().map(|r| r.0).collect();
        sqlx::query(
            "UPDATE deliveries \
             SET attempt_count = attempt_count + 1, \
                 next_attempt_at = now() + ($2 * interval '1 second') \
             WHERE id = ANY($1)",
        )
        .bind(&ids)
        .bind(lease_secs(lease))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    delivery_id,
                    campaign_id,
                    customer_id,
                    attempt_count,
                    recipient_chat_id,
                    text,
                    button_title,
                    url,
                    photo_ref,
                    shop_name,
                )| DeliveryJob {
                    delivery_id,
                    campaign_id,
                    customer_id,
                    attempt: attempt_count + 1,
                    recipient_chat_id,
                    text,
                    button_title,
                    url,
                    photo_ref,
                    shop_name,
                },
            )
            .collect())
    }

    async fn mark_sent(
        &self,
        delivery_id: i64,
        campaign_id: i64,
        channel_message_id: i64,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        // Status guard: a terminal row never regresses, and the counter is
        // only bumped when this call actually resolved the row.
        let updated = sqlx::query(
            "UPDATE deliveries \
             SET status = 'sent', sent_at = now(), channel_message_id = $2, last_error = NULL \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(delivery_id)
        .bind(channel_message_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated > 0 {
            sqlx::query("UPDATE campaigns SET sent_count = sent_count + 1 WHERE id = $1")
                .bind(campaign_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn mark_blocked(
        &self,
        delivery_id: i64,
        campaign_id: i64,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE deliveries \
             SET status = 'blocked', sent_at = now(), last_error = $2 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(delivery_id)
        .bind(truncate_error(error))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated > 0 {
            sqlx::query("UPDATE campaigns SET blocked_count = blocked_count + 1 WHERE id = $1")
                .bind(campaign_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        delivery_id: i64,
        campaign_id: i64,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE deliveries \
             SET status = 'failed', sent_at = now(), last_error = $2 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(delivery_id)
        .bind(truncate_error(error))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated > 0 {
            sqlx::query("UPDATE campaigns SET failed_count = failed_count + 1 WHERE id = $1")
                .bind(campaign_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn reschedule(
        &self,
        delivery_id: i64,
        delay: Duration,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE deliveries \
             SET status = 'pending', \
                 next_attempt_at = now() + ($2 * interval '1 second'), \
                 last_error = $3 \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(delivery_id)
        .bind(delay_secs(delay))
        .bind(truncate_error(error))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finalize_completed(&self) -> Result<u64, StoreError> {
        let flipped = sqlx::query(
            "UPDATE campaigns c \
             SET status = 'completed' \
             WHERE c.status = 'sending' \
               AND NOT EXISTS (\
                   SELECT 1 FROM deliveries d \
                   WHERE d.campaign_id = c.id AND d.status = 'pending')",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(flipped)
    }

    async fn unnotified_completed(&self) -> Result<Vec<CompletedCampaign>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, i64, String, i64, i64, i64, i64, i64, i64)>(
            "SELECT c.id, c.shop_id, sh.name, s.id, s.chat_id, \
             c.total_recipients, c.sent_count, c.failed_count, c.blocked_count \
             FROM campaigns c \
             JOIN shops sh ON sh.id = c.shop_id \
             JOIN sellers s ON s.id = sh.seller_id \
             WHERE c.status = 'completed' AND c.completed_notified = FALSE \
             ORDER BY c.id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    campaign_id,
                    shop_id,
                    shop_name,
                    seller_id,
                    seller_chat_id,
                    total_recipients,
                    sent,
                    failed,
                    blocked,
                )| CompletedCampaign {
                    campaign_id,
                    shop_id,
                    shop_name,
                    seller_id,
                    seller_chat_id,
                    summary: DeliverySummary {
                        total_recipients,
                        sent,
                        failed,
                        blocked,
                    },
                },
            )
            .collect())
    }

    async fn mark_completion_notified(&self, campaign_id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE campaigns SET completed_notified = TRUE WHERE id = $1")
            .bind(campaign_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn audience_snapshot(&self, shop_id: i64) -> Result<AudienceSnapshot, StoreError> {
        let (total, subscribed, unsubscribed) = sqlx::query_as::<_, (i64, i64, i64)>(
            "SELECT COUNT(*), \
             COUNT(*) FILTER (WHERE status = 'subscribed'), \
             COUNT(*) FILTER (WHERE status = 'unsubscribed') \
             FROM shop_customers WHERE shop_id = $1",
        )
        .bind(shop_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(AudienceSnapshot {
            total,
            subscribed,
            unsubscribed,
        })
    }
}
