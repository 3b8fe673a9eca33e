//! In-memory implementation of the engine store.
//!
//! Backs tests and embedded usage. One async mutex around the whole
//! state gives every trait method the same atomicity the PostgreSQL
//! implementation gets from transactions; the semantics (idempotent
//! grant/spend, lease bumps, terminal-status guards, audience snapshot
//! at start) are identical.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;

use super::Store;
use crate::domain::campaign::{
    AudienceSnapshot, Campaign, CampaignStatus, CompletedCampaign, DeliverySummary, StartPolicy,
};
use crate::domain::credit::{CreditReason, CreditTransaction, SellerCredit};
use crate::domain::delivery::{Delivery, DeliveryJob, DeliveryStatus, truncate_error};
use crate::error::{LedgerError, StartError, StoreError};

#[derive(Debug, Clone)]
struct SellerRow {
    chat_id: i64,
}

#[derive(Debug, Clone)]
struct ShopRow {
    seller_id: i64,
    name: String,
}

#[derive(Debug, Clone)]
struct CustomerRow {
    chat_id: i64,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    sellers: HashMap<i64, SellerRow>,
    credits: HashMap<i64, SellerCredit>,
    transactions: Vec<CreditTransaction>,
    shops: HashMap<i64, ShopRow>,
    customers: HashMap<i64, CustomerRow>,
    /// (shop_id, customer_id) → currently subscribed.
    subscriptions: HashMap<(i64, i64), bool>,
    campaigns: HashMap<i64, Campaign>,
    deliveries: HashMap<i64, Delivery>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn spend_locked(&mut self, seller_id: i64, campaign_id: i64) -> Result<i64, LedgerError> {
        let already_spent = self.transactions.iter().any(|t| {
            t.seller_id == seller_id
                && t.campaign_id == Some(campaign_id)
                && t.reason == CreditReason::CampaignSend
        });
        if already_spent {
            return self
                .credits
                .get(&seller_id)
                .map(|c| c.balance)
                .ok_or(LedgerError::AccountMissing { seller_id });
        }

        let Some(account) = self.credits.get_mut(&seller_id) else {
            return Err(LedgerError::AccountMissing { seller_id });
        };
        if account.balance < 1 {
            return Err(LedgerError::InsufficientCredits { seller_id });
        }
        account.balance -= 1;
        account.updated_at = Utc::now();
        let balance = account.balance;

        let id = self.next_id();
        self.transactions.push(CreditTransaction {
            id,
            seller_id,
            delta: -1,
            reason: CreditReason::CampaignSend,
            balance_after: balance,
            campaign_id: Some(campaign_id),
            external_charge_id: None,
            created_at: Utc::now(),
        });
        Ok(balance)
    }
}

fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// In-memory store behind one async mutex.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a seller with a zero-balance credit account.
    /// Fixture for the out-of-scope CRUD flow.
    pub async fn add_seller(&self, chat_id: i64) -> i64 {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id();
        inner.sellers.insert(id, SellerRow { chat_id });
        inner.credits.insert(
            id,
            SellerCredit {
                seller_id: id,
                balance: 0,
                updated_at: Utc::now(),
            },
        );
        id
    }

    /// Creates a shop owned by a seller.
    pub async fn add_shop(&self, seller_id: i64, name: &str) -> i64 {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id();
        inner.shops.insert(
            id,
            ShopRow {
                seller_id,
                name: name.to_string(),
            },
        );
        id
    }

    /// Creates a customer reachable at `chat_id`.
    pub async fn add_customer(&self, chat_id: i64) -> i64 {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id();
        inner.customers.insert(id, CustomerRow { chat_id });
        id
    }

    /// Subscribes a customer to a shop (upsert, like the CRUD flow).
    pub async fn subscribe(&self, shop_id: i64, customer_id: i64) {
        let mut inner = self.inner.lock().await;
        inner.subscriptions.insert((shop_id, customer_id), true);
    }

    /// Unsubscribes a customer from a shop.
    pub async fn unsubscribe(&self, shop_id: i64, customer_id: i64) {
        let mut inner = self.inner.lock().await;
        inner.subscriptions.insert((shop_id, customer_id), false);
    }

    /// Creates a draft campaign for a shop.
    pub async fn add_campaign(&self, shop_id: i64, text: &str, button_title: &str, url: &str) -> i64 {
        let mut inner = self.inner.lock().await;
        let id = inner.next_id();
        inner.campaigns.insert(
            id,
            Campaign {
                id,
                shop_id,
                status: CampaignStatus::Draft,
                text: text.to_string(),
                button_title: button_title.to_string(),
                url: url.to_string(),
                photo_ref: None,
                price_minor: 50_000,
                currency: "RUB".to_string(),
                total_recipients: 0,
                sent_count: 0,
                failed_count: 0,
                blocked_count: 0,
                completed_notified: false,
                created_at: Utc::now(),
                paid_at: None,
            },
        );
        id
    }

    /// Confirms payment for a draft campaign. Returns `false` when the
    /// transition is not allowed from the current status.
    pub async fn mark_paid(&self, campaign_id: i64) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(campaign) = inner.campaigns.get_mut(&campaign_id) else {
            return false;
        };
        if !campaign.status.can_transition_to(CampaignStatus::Paid) {
            return false;
        }
        campaign.status = CampaignStatus::Paid;
        campaign.paid_at = Some(Utc::now());
        true
    }

    /// Cancels a campaign. Returns `false` when the transition is not
    /// allowed from the current status.
    pub async fn cancel_campaign(&self, campaign_id: i64) -> bool {
        let mut inner = self.inner.lock().await;
        let Some(campaign) = inner.campaigns.get_mut(&campaign_id) else {
            return false;
        };
        if !campaign.status.can_transition_to(CampaignStatus::Canceled) {
            return false;
        }
        campaign.status = CampaignStatus::Canceled;
        true
    }

    /// Returns the delivery rows of a campaign, ordered by row ID.
    pub async fn delivery_rows(&self, campaign_id: i64) -> Vec<Delivery> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<Delivery> = inner
            .deliveries
            .values()
            .filter(|d| d.campaign_id == campaign_id)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.id);
        rows
    }

    /// Makes a delivery due immediately, collapsing a pending backoff or
    /// lease window. Test support for crash/retry scenarios.
    pub async fn make_due(&self, delivery_id: i64) {
        let mut inner = self.inner.lock().await;
        if let Some(d) = inner.deliveries.get_mut(&delivery_id) {
            d.next_attempt_at = Utc::now() - TimeDelta::seconds(1);
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn grant_credits(
        &self,
        seller_id: i64,
        amount: i64,
        reason: CreditReason,
        external_charge_id: Option<&str>,
    ) -> Result<i64, LedgerError> {
        let mut inner = self.inner.lock().await;

        if let Some(charge) = external_charge_id {
            let replayed = inner.transactions.iter().any(|t| {
                t.seller_id == seller_id && t.external_charge_id.as_deref() == Some(charge)
            });
            if replayed {
                return Ok(inner.credits.get(&seller_id).map_or(0, |c| c.balance));
            }
        }

        let account = inner.credits.entry(seller_id).or_insert(SellerCredit {
            seller_id,
            balance: 0,
            updated_at: Utc::now(),
        });
        account.balance += amount;
        account.updated_at = Utc::now();
        let balance = account.balance;

        let id = inner.next_id();
        inner.transactions.push(CreditTransaction {
            id,
            seller_id,
            delta: amount,
            reason,
            balance_after: balance,
            campaign_id: None,
            external_charge_id: external_charge_id.map(ToString::to_string),
            created_at: Utc::now(),
        });
        Ok(balance)
    }

    async fn spend_credit(&self, seller_id: i64, campaign_id: i64) -> Result<i64, LedgerError> {
        let mut inner = self.inner.lock().await;
        inner.spend_locked(seller_id, campaign_id)
    }

    async fn credit_balance(&self, seller_id: i64) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.credits.get(&seller_id).map_or(0, |c| c.balance))
    }

    async fn credit_transactions(
        &self,
        seller_id: i64,
    ) -> Result<Vec<CreditTransaction>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transactions
            .iter()
            .filter(|t| t.seller_id == seller_id)
            .cloned()
            .collect())
    }

    async fn start_campaign(
        &self,
        seller_id: i64,
        campaign_id: i64,
        policy: &StartPolicy,
    ) -> Result<i64, StartError> {
        let mut inner = self.inner.lock().await;

        let Some((shop_id, status)) = inner.campaigns.get(&campaign_id).and_then(|c| {
            let shop = inner.shops.get(&c.shop_id)?;
            (shop.seller_id == seller_id).then_some((c.shop_id, c.status))
        }) else {
            return Err(StartError::CampaignNotFound);
        };
        policy.check(status)?;

        inner.spend_locked(seller_id, campaign_id)?;

        // Fan-out: audience snapshot of currently-subscribed customers,
        // insert-or-ignore keyed on (campaign_id, customer_id).
        let recipients: Vec<i64> = inner
            .subscriptions
            .iter()
            .filter(|&(&(sid, _), &subscribed)| sid == shop_id && subscribed)
            .map(|(&(_, customer_id), _)| customer_id)
            .collect();
        for customer_id in recipients {
            let exists = inner
                .deliveries
                .values()
                .any(|d| d.campaign_id == campaign_id && d.customer_id == customer_id);
            if exists {
                continue;
            }
            let id = inner.next_id();
            inner.deliveries.insert(
                id,
                Delivery {
                    id,
                    campaign_id,
                    customer_id,
                    status: DeliveryStatus::Pending,
                    attempt_count: 0,
                    next_attempt_at: Utc::now(),
                    sent_at: None,
                    last_error: None,
                    channel_message_id: None,
                },
            );
        }

        let total = i64::try_from(
            inner
                .deliveries
                .values()
                .filter(|d| d.campaign_id == campaign_id)
                .count(),
        )
        .unwrap_or(i64::MAX);

        if let Some(campaign) = inner.campaigns.get_mut(&campaign_id) {
            campaign.status = CampaignStatus::Sending;
            campaign.total_recipients = total;
            campaign.sent_count = 0;
            campaign.failed_count = 0;
            campaign.blocked_count = 0;
        }
        Ok(total)
    }

    async fn campaign(&self, campaign_id: i64) -> Result<Option<Campaign>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.campaigns.get(&campaign_id).cloned())
    }

    async fn lease_due(
        &self,
        batch_size: i64,
        lease: Duration,
    ) -> Result<Vec<DeliveryJob>, StoreError> {
        if batch_size <= 0 {
            return Ok(Vec::new());
        }
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let mut due: Vec<(DateTime<Utc>, i64)> = inner
            .deliveries
            .values()
            .filter(|d| {
                d.status == DeliveryStatus::Pending
                    && d.next_attempt_at <= now
                    && inner
                        .campaigns
                        .get(&d.campaign_id)
                        .is_some_and(|c| c.status == CampaignStatus::Sending)
            })
            .map(|d| (d.next_attempt_at, d.id))
            .collect();
        due.sort();
        due.truncate(usize::try_from(batch_size).unwrap_or(usize::MAX));

        let mut jobs = Vec::with_capacity(due.len());
        for (_, delivery_id) in due {
            let Some(d) = inner.deliveries.get_mut(&delivery_id) else {
                continue;
            };
            d.attempt_count += 1;
            d.next_attempt_at = now + delta(lease);
            let (campaign_id, customer_id, attempt) = (d.campaign_id, d.customer_id, d.attempt_count);

            let Some(campaign) = inner.campaigns.get(&campaign_id) else {
                continue;
            };
            let Some(customer) = inner.customers.get(&customer_id) else {
                continue;
            };
            let shop_name = inner
                .shops
                .get(&campaign.shop_id)
                .map_or_else(String::new, |s| s.name.clone());

            jobs.push(DeliveryJob {
                delivery_id,
                campaign_id,
                customer_id,
                attempt,
                recipient_chat_id: customer.chat_id,
                text: campaign.text.clone(),
                button_title: campaign.button_title.clone(),
                url: campaign.url.clone(),
                photo_ref: campaign.photo_ref.clone(),
                shop_name,
            });
        }
        Ok(jobs)
    }

    async fn mark_sent(
        &self,
        delivery_id: i64,
        campaign_id: i64,
        channel_message_id: i64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let resolved = inner.deliveries.get_mut(&delivery_id).is_some_and(|d| {
            if d.status != DeliveryStatus::Pending {
                return false;
            }
            d.status = DeliveryStatus::Sent;
            d.sent_at = Some(Utc::now());
            d.channel_message_id = Some(channel_message_id);
            d.last_error = None;
            true
        });
        if resolved {
            if let Some(campaign) = inner.campaigns.get_mut(&campaign_id) {
                campaign.sent_count += 1;
            }
        }
        Ok(())
    }

    async fn mark_blocked(
        &self,
        delivery_id: i64,
        campaign_id: i64,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let resolved = inner.deliveries.get_mut(&delivery_id).is_some_and(|d| {
            if d.status != DeliveryStatus::Pending {
                return false;
            }
            d.status = DeliveryStatus::Blocked;
            d.sent_at = Some(Utc::now());
            d.last_error = Some(truncate_error(error));
            true
        });
        if resolved {
            if let Some(campaign) = inner.campaigns.get_mut(&campaign_id) {
                campaign.blocked_count += 1;
            }
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        delivery_id: i64,
        campaign_id: i64,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let resolved = inner.deliveries.get_mut(&delivery_id).is_some_and(|d| {
            if d.status != DeliveryStatus::Pending {
                return false;
            }
            d.status = DeliveryStatus::Failed;
            d.sent_at = Some(Utc::now());
            d.last_error = Some(truncate_error(error));
            true
        });
        if resolved {
            if let Some(campaign) = inner.campaigns.get_mut(&campaign_id) {
                campaign.failed_count += 1;
            }
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        delivery_id: i64,
        delay: Duration,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(d) = inner.deliveries.get_mut(&delivery_id) {
            if d.status == DeliveryStatus::Pending {
                d.next_attempt_at = Utc::now() + delta(delay.max(Duration::from_secs(1)));
                d.last_error = Some(truncate_error(error));
            }
        }
        Ok(())
    }

    async fn finalize_completed(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let drained: Vec<i64> = inner
            .campaigns
            .values()
            .filter(|c| {
                c.status == CampaignStatus::Sending
                    && !inner.deliveries.values().any(|d| {
                        d.campaign_id == c.id && d.status == DeliveryStatus::Pending
                    })
            })
            .map(|c| c.id)
            .collect();
        for id in &drained {
            if let Some(campaign) = inner.campaigns.get_mut(id) {
                campaign.status = CampaignStatus::Completed;
            }
        }
        Ok(drained.len() as u64)
    }

    async fn unnotified_completed(&self) -> Result<Vec<CompletedCampaign>, StoreError> {
        let inner = self.inner.lock().await;
        let mut completed: Vec<CompletedCampaign> = inner
            .campaigns
            .values()
            .filter(|c| c.status == CampaignStatus::Completed && !c.completed_notified)
            .filter_map(|c| {
                let shop = inner.shops.get(&c.shop_id)?;
                let seller = inner.sellers.get(&shop.seller_id)?;
                Some(CompletedCampaign {
                    campaign_id: c.id,
                    shop_id: c.shop_id,
                    shop_name: shop.name.clone(),
                    seller_id: shop.seller_id,
                    seller_chat_id: seller.chat_id,
                    summary: DeliverySummary {
                        total_recipients: c.total_recipients,
                        sent: c.sent_count,
                        failed: c.failed_count,
                        blocked: c.blocked_count,
                    },
                })
            })
            .collect();
        completed.sort_by_key(|c| c.campaign_id);
        Ok(completed)
    }

    async fn mark_completion_notified(&self, campaign_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(campaign) = inner.campaigns.get_mut(&campaign_id) {
            campaign.completed_notified = true;
        }
        Ok(())
    }

    async fn audience_snapshot(&self, shop_id: i64) -> Result<AudienceSnapshot, StoreError> {
        let inner = self.inner.lock().await;
        let mut snapshot = AudienceSnapshot {
            total: 0,
            subscribed: 0,
            unsubscribed: 0,
        };
        for (&(sid, _), &subscribed) in &inner.subscriptions {
            if sid != shop_id {
                continue;
            }
            snapshot.total += 1;
            if subscribed {
                snapshot.subscribed += 1;
            } else {
                snapshot.unsubscribed += 1;
            }
        }
        Ok(snapshot)
    }
}
