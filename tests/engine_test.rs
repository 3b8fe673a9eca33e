//! End-to-end engine tests over the in-memory store: ledger invariants,
//! campaign start guards, lease/retry behavior and completion notices.

#![allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use loyalty_engine::channel::{CompletionNotice, OutboundChannel};
use loyalty_engine::domain::{CampaignStatus, CreditReason, DeliveryJob, DeliveryStatus};
use loyalty_engine::error::{LedgerError, SendError, StartError};
use loyalty_engine::store::{MemoryStore, Store};
use loyalty_engine::worker::{Worker, WorkerConfig};

/// Scripted channel: per-recipient queues of failures, `Ok` once the
/// queue is drained. Records every confirmed completion notice.
#[derive(Debug, Default)]
struct FakeChannel {
    scripts: Mutex<HashMap<i64, VecDeque<SendError>>>,
    notices: Mutex<Vec<(i64, CompletionNotice)>>,
    fail_notices: AtomicBool,
    next_message_id: AtomicI64,
}

impl FakeChannel {
    fn script_failure(&self, chat_id: i64, error: SendError) {
        self.scripts
            .lock()
            .unwrap()
            .entry(chat_id)
            .or_default()
            .push_back(error);
    }

    fn set_fail_notices(&self, fail: bool) {
        self.fail_notices.store(fail, Ordering::Relaxed);
    }

    fn notices(&self) -> Vec<(i64, CompletionNotice)> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboundChannel for FakeChannel {
    async fn send_campaign_message(&self, job: &DeliveryJob) -> Result<i64, SendError> {
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&job.recipient_chat_id)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(error) => Err(error),
            None => Ok(self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1),
        }
    }

    async fn send_completion_notice(
        &self,
        seller_chat_id: i64,
        notice: &CompletionNotice,
    ) -> Result<(), SendError> {
        if self.fail_notices.load(Ordering::Relaxed) {
            return Err(SendError::Transient("notice channel down".to_string()));
        }
        self.notices
            .lock()
            .unwrap()
            .push((seller_chat_id, notice.clone()));
        Ok(())
    }
}

fn test_config() -> WorkerConfig {
    WorkerConfig {
        batch_size: 100,
        max_sends_per_second: 10_000,
        ..WorkerConfig::default()
    }
}

const SELLER_CHAT_ID: i64 = 9000;

/// Seller with a paid campaign and `subscribers` subscribed customers
/// (customer chat IDs start at 100).
async fn seeded_campaign(store: &MemoryStore, subscribers: i64) -> (i64, i64, i64) {
    let seller_id = store.add_seller(SELLER_CHAT_ID).await;
    let shop_id = store.add_shop(seller_id, "Coffee Roasters").await;
    for i in 0..subscribers {
        let customer_id = store.add_customer(100 + i).await;
        store.subscribe(shop_id, customer_id).await;
    }
    let campaign_id = store
        .add_campaign(
            shop_id,
            "Fresh beans in stock",
            "Open shop",
            "https://example.com/shop",
        )
        .await;
    assert!(store.mark_paid(campaign_id).await);
    (seller_id, shop_id, campaign_id)
}

#[tokio::test]
async fn ledger_balance_matches_transaction_deltas() {
    let store = MemoryStore::new();
    let (seller_id, _, campaign_id) = seeded_campaign(&store, 1).await;

    let Ok(after_signup) = store
        .grant_credits(seller_id, 1, CreditReason::FreeSignup, None)
        .await
    else {
        panic!("signup grant failed");
    };
    assert_eq!(after_signup, 1);

    let Ok(after_purchase) = store
        .grant_credits(seller_id, 5, CreditReason::CreditsPurchase, Some("chg-1"))
        .await
    else {
        panic!("purchase grant failed");
    };
    assert_eq!(after_purchase, 6);

    let Ok(after_spend) = store.spend_credit(seller_id, campaign_id).await else {
        panic!("spend failed");
    };
    assert_eq!(after_spend, 5);

    let Ok(transactions) = store.credit_transactions(seller_id).await else {
        panic!("transactions query failed");
    };
    let delta_sum: i64 = transactions.iter().map(|t| t.delta).sum();
    let Ok(balance) = store.credit_balance(seller_id).await else {
        panic!("balance query failed");
    };
    assert_eq!(delta_sum, balance);
    let Some(last) = transactions.last() else {
        panic!("ledger is empty");
    };
    assert_eq!(last.balance_after, balance);
}

#[tokio::test]
async fn grant_is_idempotent_per_charge_id() {
    let store = MemoryStore::new();
    let seller_id = store.add_seller(SELLER_CHAT_ID).await;

    let Ok(first) = store
        .grant_credits(seller_id, 10, CreditReason::CreditsPurchase, Some("chg-7"))
        .await
    else {
        panic!("first grant failed");
    };
    assert_eq!(first, 10);

    // Payment provider redelivery of the same charge.
    let Ok(replayed) = store
        .grant_credits(seller_id, 10, CreditReason::CreditsPurchase, Some("chg-7"))
        .await
    else {
        panic!("replayed grant failed");
    };
    assert_eq!(replayed, 10);

    let Ok(transactions) = store.credit_transactions(seller_id).await else {
        panic!("transactions query failed");
    };
    assert_eq!(transactions.len(), 1);
}

#[tokio::test]
async fn concurrent_spends_never_overdraw() {
    let store = MemoryStore::new();
    let (seller_id, shop_id, campaign_a) = seeded_campaign(&store, 1).await;
    let campaign_b = store
        .add_campaign(shop_id, "Second blast", "Open", "https://example.com")
        .await;
    assert!(store.mark_paid(campaign_b).await);

    let Ok(_) = store
        .grant_credits(seller_id, 1, CreditReason::AdminGrant, None)
        .await
    else {
        panic!("grant failed");
    };

    let (a, b) = tokio::join!(
        store.spend_credit(seller_id, campaign_a),
        store.spend_credit(seller_id, campaign_b),
    );
    let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    assert!(
        [&a, &b]
            .iter()
            .any(|r| matches!(r, Err(LedgerError::InsufficientCredits { .. }))),
        "loser must see InsufficientCredits, got {a:?} / {b:?}"
    );
    let Ok(balance) = store.credit_balance(seller_id).await else {
        panic!("balance query failed");
    };
    assert_eq!(balance, 0);
}

#[tokio::test]
async fn spend_is_idempotent_per_campaign() {
    let store = MemoryStore::new();
    let (seller_id, _, campaign_id) = seeded_campaign(&store, 1).await;
    let Ok(_) = store
        .grant_credits(seller_id, 2, CreditReason::AdminGrant, None)
        .await
    else {
        panic!("grant failed");
    };

    let Ok(first) = store.spend_credit(seller_id, campaign_id).await else {
        panic!("first spend failed");
    };
    // Crash-retry of the same start must not charge twice.
    let Ok(second) = store.spend_credit(seller_id, campaign_id).await else {
        panic!("replayed spend failed");
    };
    assert_eq!(first, 1);
    assert_eq!(second, 1);
}

#[tokio::test]
async fn start_enqueues_snapshot_and_flips_to_sending() {
    let store = MemoryStore::new();
    let (seller_id, shop_id, campaign_id) = seeded_campaign(&store, 4).await;
    // One lapsed subscriber must not receive anything.
    let lapsed = store.add_customer(999).await;
    store.subscribe(shop_id, lapsed).await;
    store.unsubscribe(shop_id, lapsed).await;

    let Ok(_) = store
        .grant_credits(seller_id, 3, CreditReason::AdminGrant, None)
        .await
    else {
        panic!("grant failed");
    };

    let Ok(total) = store
        .start_campaign(seller_id, campaign_id, &Default::default())
        .await
    else {
        panic!("start failed");
    };
    assert_eq!(total, 4);

    let Ok(balance) = store.credit_balance(seller_id).await else {
        panic!("balance query failed");
    };
    assert_eq!(balance, 2);

    let Ok(Some(campaign)) = store.campaign(campaign_id).await else {
        panic!("campaign vanished");
    };
    assert_eq!(campaign.status, CampaignStatus::Sending);
    assert_eq!(campaign.total_recipients, 4);

    let rows = store.delivery_rows(campaign_id).await;
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|d| d.status == DeliveryStatus::Pending));
}

#[tokio::test]
async fn start_rejects_wrong_status_and_wrong_owner() {
    let store = MemoryStore::new();
    let (seller_id, shop_id, paid_campaign) = seeded_campaign(&store, 1).await;
    let Ok(_) = store
        .grant_credits(seller_id, 5, CreditReason::AdminGrant, None)
        .await
    else {
        panic!("grant failed");
    };

    // Unpaid draft.
    let draft = store
        .add_campaign(shop_id, "Draft", "Open", "https://example.com")
        .await;
    let result = store
        .start_campaign(seller_id, draft, &Default::default())
        .await;
    assert!(matches!(
        result,
        Err(StartError::CampaignInvalidStatus(CampaignStatus::Draft))
    ));

    // Canceled before payment.
    let canceled = store
        .add_campaign(shop_id, "Canceled", "Open", "https://example.com")
        .await;
    assert!(store.cancel_campaign(canceled).await);
    let result = store
        .start_campaign(seller_id, canceled, &Default::default())
        .await;
    assert!(matches!(
        result,
        Err(StartError::CampaignInvalidStatus(CampaignStatus::Canceled))
    ));

    // Someone else's campaign is indistinguishable from a missing one.
    let stranger = store.add_seller(4242).await;
    let result = store
        .start_campaign(stranger, paid_campaign, &Default::default())
        .await;
    assert!(matches!(result, Err(StartError::CampaignNotFound)));

    // Double start.
    let Ok(_) = store
        .start_campaign(seller_id, paid_campaign, &Default::default())
        .await
    else {
        panic!("first start failed");
    };
    let result = store
        .start_campaign(seller_id, paid_campaign, &Default::default())
        .await;
    assert!(matches!(result, Err(StartError::CampaignAlreadyStarted)));
}

#[tokio::test]
async fn start_without_credits_enqueues_nothing() {
    let store = MemoryStore::new();
    let (seller_id, _, campaign_id) = seeded_campaign(&store, 3).await;

    let result = store
        .start_campaign(seller_id, campaign_id, &Default::default())
        .await;
    assert!(matches!(
        result,
        Err(StartError::Ledger(LedgerError::InsufficientCredits { .. }))
    ));

    let Ok(Some(campaign)) = store.campaign(campaign_id).await else {
        panic!("campaign vanished");
    };
    assert_eq!(campaign.status, CampaignStatus::Paid);
    assert!(store.delivery_rows(campaign_id).await.is_empty());
}

#[tokio::test]
async fn audience_is_snapshotted_at_start() {
    let store = MemoryStore::new();
    let (seller_id, shop_id, campaign_id) = seeded_campaign(&store, 2).await;
    let Ok(_) = store
        .grant_credits(seller_id, 1, CreditReason::AdminGrant, None)
        .await
    else {
        panic!("grant failed");
    };
    let Ok(total) = store
        .start_campaign(seller_id, campaign_id, &Default::default())
        .await
    else {
        panic!("start failed");
    };
    assert_eq!(total, 2);

    // A customer subscribing after the start is not part of this send.
    let late = store.add_customer(777).await;
    store.subscribe(shop_id, late).await;
    assert_eq!(store.delivery_rows(campaign_id).await.len(), 2);

    let Ok(audience) = store.audience_snapshot(shop_id).await else {
        panic!("snapshot failed");
    };
    assert_eq!(audience.subscribed, 3);
}

#[tokio::test]
async fn lease_hides_rows_until_the_lease_expires() {
    let store = MemoryStore::new();
    let (seller_id, _, campaign_id) = seeded_campaign(&store, 3).await;
    let Ok(_) = store
        .grant_credits(seller_id, 1, CreditReason::AdminGrant, None)
        .await
    else {
        panic!("grant failed");
    };
    let Ok(_) = store
        .start_campaign(seller_id, campaign_id, &Default::default())
        .await
    else {
        panic!("start failed");
    };

    let Ok(first) = store.lease_due(10, Duration::from_secs(300)).await else {
        panic!("lease failed");
    };
    assert_eq!(first.len(), 3);
    assert!(first.iter().all(|j| j.attempt == 1));

    // Still leased; nothing is due.
    let Ok(second) = store.lease_due(10, Duration::from_secs(300)).await else {
        panic!("lease failed");
    };
    assert!(second.is_empty());
}

#[tokio::test]
async fn crashed_lease_is_reclaimed_with_a_higher_attempt() {
    let store = MemoryStore::new();
    let (seller_id, _, campaign_id) = seeded_campaign(&store, 1).await;
    let Ok(_) = store
        .grant_credits(seller_id, 1, CreditReason::AdminGrant, None)
        .await
    else {
        panic!("grant failed");
    };
    let Ok(_) = store
        .start_campaign(seller_id, campaign_id, &Default::default())
        .await
    else {
        panic!("start failed");
    };

    // Zero-length lease simulates a worker that claimed the row and died.
    let Ok(claimed) = store.lease_due(10, Duration::ZERO).await else {
        panic!("lease failed");
    };
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed.first().map(|j| j.attempt), Some(1));

    let Ok(reclaimed) = store.lease_due(10, Duration::from_secs(300)).await else {
        panic!("lease failed");
    };
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed.first().map(|j| j.attempt), Some(2));
}

#[tokio::test]
async fn terminal_rows_ignore_stale_outcomes() {
    let store = MemoryStore::new();
    let (seller_id, _, campaign_id) = seeded_campaign(&store, 1).await;
    let Ok(_) = store
        .grant_credits(seller_id, 1, CreditReason::AdminGrant, None)
        .await
    else {
        panic!("grant failed");
    };
    let Ok(_) = store
        .start_campaign(seller_id, campaign_id, &Default::default())
        .await
    else {
        panic!("start failed");
    };
    let Ok(jobs) = store.lease_due(10, Duration::from_secs(300)).await else {
        panic!("lease failed");
    };
    let Some(job) = jobs.first() else {
        panic!("no job leased");
    };

    let Ok(()) = store.mark_sent(job.delivery_id, campaign_id, 555).await else {
        panic!("mark_sent failed");
    };
    // A worker whose lease expired reports late; the row must not move.
    let Ok(()) = store
        .mark_blocked(job.delivery_id, campaign_id, "late duplicate outcome")
        .await
    else {
        panic!("mark_blocked failed");
    };

    let rows = store.delivery_rows(campaign_id).await;
    assert_eq!(rows.first().map(|d| d.status), Some(DeliveryStatus::Sent));
    let Ok(Some(campaign)) = store.campaign(campaign_id).await else {
        panic!("campaign vanished");
    };
    assert_eq!(campaign.sent_count, 1);
    assert_eq!(campaign.blocked_count, 0);
}

#[tokio::test]
async fn stored_errors_are_truncated() {
    let store = MemoryStore::new();
    let (seller_id, _, campaign_id) = seeded_campaign(&store, 1).await;
    let Ok(_) = store
        .grant_credits(seller_id, 1, CreditReason::AdminGrant, None)
        .await
    else {
        panic!("grant failed");
    };
    let Ok(_) = store
        .start_campaign(seller_id, campaign_id, &Default::default())
        .await
    else {
        panic!("start failed");
    };
    let Ok(jobs) = store.lease_due(10, Duration::from_secs(300)).await else {
        panic!("lease failed");
    };
    let Some(job) = jobs.first() else {
        panic!("no job leased");
    };

    let huge = "x".repeat(6000);
    let Ok(()) = store
        .reschedule(job.delivery_id, Duration::from_secs(5), &huge)
        .await
    else {
        panic!("reschedule failed");
    };
    let rows = store.delivery_rows(campaign_id).await;
    let Some(error) = rows.first().and_then(|d| d.last_error.clone()) else {
        panic!("error text missing");
    };
    assert_eq!(error.chars().count(), 5000);
}

#[tokio::test]
async fn transient_failures_back_off_exponentially() {
    let store = Arc::new(MemoryStore::new());
    let channel = Arc::new(FakeChannel::default());
    let (seller_id, _, campaign_id) = seeded_campaign(&store, 1).await;
    let Ok(_) = store
        .grant_credits(seller_id, 1, CreditReason::AdminGrant, None)
        .await
    else {
        panic!("grant failed");
    };
    let Ok(_) = store
        .start_campaign(seller_id, campaign_id, &Default::default())
        .await
    else {
        panic!("start failed");
    };
    channel.script_failure(100, SendError::Transient("gateway timeout".to_string()));
    channel.script_failure(100, SendError::Transient("gateway timeout".to_string()));

    let worker = Worker::new(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&channel) as Arc<dyn OutboundChannel>, test_config());

    // Attempt 1 → base delay (5s).
    let Ok(1) = worker.tick().await else {
        panic!("first tick did not process the delivery");
    };
    let rows = store.delivery_rows(campaign_id).await;
    let Some(row) = rows.first() else {
        panic!("delivery vanished");
    };
    assert_eq!(row.status, DeliveryStatus::Pending);
    assert_eq!(row.attempt_count, 1);
    let delay = (row.next_attempt_at - Utc::now()).num_seconds();
    assert!((3..=6).contains(&delay), "expected ~5s delay, got {delay}s");

    // Attempt 2 → doubled delay (10s).
    store.make_due(row.id).await;
    let Ok(1) = worker.tick().await else {
        panic!("second tick did not process the delivery");
    };
    let rows = store.delivery_rows(campaign_id).await;
    let Some(row) = rows.first() else {
        panic!("delivery vanished");
    };
    assert_eq!(row.attempt_count, 2);
    let delay = (row.next_attempt_at - Utc::now()).num_seconds();
    assert!((8..=11).contains(&delay), "expected ~10s delay, got {delay}s");
}

#[tokio::test]
async fn rate_limit_uses_the_channel_supplied_delay() {
    let store = Arc::new(MemoryStore::new());
    let channel = Arc::new(FakeChannel::default());
    let (seller_id, _, campaign_id) = seeded_campaign(&store, 1).await;
    let Ok(_) = store
        .grant_credits(seller_id, 1, CreditReason::AdminGrant, None)
        .await
    else {
        panic!("grant failed");
    };
    let Ok(_) = store
        .start_campaign(seller_id, campaign_id, &Default::default())
        .await
    else {
        panic!("start failed");
    };
    channel.script_failure(
        100,
        SendError::RateLimited {
            retry_after_secs: 30,
        },
    );

    let worker = Worker::new(Arc::clone(&store) as Arc<dyn Store>, channel, test_config());
    let Ok(1) = worker.tick().await else {
        panic!("tick did not process the delivery");
    };

    let rows = store.delivery_rows(campaign_id).await;
    let Some(row) = rows.first() else {
        panic!("delivery vanished");
    };
    assert_eq!(row.status, DeliveryStatus::Pending);
    let delay = (row.next_attempt_at - Utc::now()).num_seconds();
    assert!(
        (28..=31).contains(&delay),
        "expected ~30s delay, got {delay}s"
    );
}

#[tokio::test]
async fn campaign_runs_to_completion_with_one_notice() {
    let store = Arc::new(MemoryStore::new());
    let channel = Arc::new(FakeChannel::default());
    let (seller_id, _, campaign_id) = seeded_campaign(&store, 4).await;
    let Ok(_) = store
        .grant_credits(seller_id, 1, CreditReason::AdminGrant, None)
        .await
    else {
        panic!("grant failed");
    };
    let Ok(_) = store
        .start_campaign(seller_id, campaign_id, &Default::default())
        .await
    else {
        panic!("start failed");
    };

    // Chat 100 succeeds; 101 blocked; 102 invalid; 103 flakes once.
    channel.script_failure(101, SendError::Blocked("forbidden".to_string()));
    channel.script_failure(102, SendError::BadRequest("chat not found".to_string()));
    channel.script_failure(103, SendError::Transient("connection reset".to_string()));

    let worker = Worker::new(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&channel) as Arc<dyn OutboundChannel>, test_config());
    let Ok(4) = worker.tick().await else {
        panic!("first tick did not process the batch");
    };
    assert!(channel.notices().is_empty(), "campaign is not drained yet");

    // Bring the flaky delivery back and let the retry succeed.
    let rows = store.delivery_rows(campaign_id).await;
    let Some(retrying) = rows.iter().find(|d| d.status == DeliveryStatus::Pending) else {
        panic!("expected one retrying delivery");
    };
    store.make_due(retrying.id).await;
    let Ok(1) = worker.tick().await else {
        panic!("second tick did not process the retry");
    };

    let Ok(Some(campaign)) = store.campaign(campaign_id).await else {
        panic!("campaign vanished");
    };
    assert_eq!(campaign.status, CampaignStatus::Completed);
    assert!(campaign.completed_notified);
    assert_eq!(campaign.sent_count, 2);
    assert_eq!(campaign.blocked_count, 1);
    assert_eq!(campaign.failed_count, 1);

    let notices = channel.notices();
    assert_eq!(notices.len(), 1);
    let Some((chat_id, notice)) = notices.first() else {
        panic!("notice missing");
    };
    assert_eq!(*chat_id, SELLER_CHAT_ID);
    assert_eq!(notice.campaign_id, campaign_id);
    assert_eq!(notice.summary.total_recipients, 4);
    assert_eq!(notice.summary.sent, 2);
    assert_eq!(notice.summary.not_delivered(), 2);

    // Further ticks must not repeat the notice.
    let Ok(0) = worker.tick().await else {
        panic!("queue should be drained");
    };
    assert_eq!(channel.notices().len(), 1);
}

#[tokio::test]
async fn failed_notice_is_retried_until_confirmed() {
    let store = Arc::new(MemoryStore::new());
    let channel = Arc::new(FakeChannel::default());
    let (seller_id, _, campaign_id) = seeded_campaign(&store, 1).await;
    let Ok(_) = store
        .grant_credits(seller_id, 1, CreditReason::AdminGrant, None)
        .await
    else {
        panic!("grant failed");
    };
    let Ok(_) = store
        .start_campaign(seller_id, campaign_id, &Default::default())
        .await
    else {
        panic!("start failed");
    };

    channel.set_fail_notices(true);
    let worker = Worker::new(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&channel) as Arc<dyn OutboundChannel>, test_config());
    let Ok(1) = worker.tick().await else {
        panic!("tick did not process the delivery");
    };

    // Campaign completed, but the notice did not go out; the flag must
    // stay down so the next pass retries.
    let Ok(Some(campaign)) = store.campaign(campaign_id).await else {
        panic!("campaign vanished");
    };
    assert_eq!(campaign.status, CampaignStatus::Completed);
    assert!(!campaign.completed_notified);
    assert!(channel.notices().is_empty());

    channel.set_fail_notices(false);
    let Ok(0) = worker.tick().await else {
        panic!("queue should be drained");
    };
    let Ok(Some(campaign)) = store.campaign(campaign_id).await else {
        panic!("campaign vanished");
    };
    assert!(campaign.completed_notified);
    assert_eq!(channel.notices().len(), 1);

    let Ok(0) = worker.tick().await else {
        panic!("queue should be drained");
    };
    assert_eq!(channel.notices().len(), 1);
}

#[tokio::test]
async fn finalize_skips_campaigns_with_pending_work() {
    let store = MemoryStore::new();
    let (seller_id, _, campaign_id) = seeded_campaign(&store, 2).await;
    let Ok(_) = store
        .grant_credits(seller_id, 1, CreditReason::AdminGrant, None)
        .await
    else {
        panic!("grant failed");
    };
    let Ok(_) = store
        .start_campaign(seller_id, campaign_id, &Default::default())
        .await
    else {
        panic!("start failed");
    };
    let Ok(jobs) = store.lease_due(10, Duration::from_secs(300)).await else {
        panic!("lease failed");
    };
    let Some(job) = jobs.first() else {
        panic!("no job leased");
    };
    let Ok(()) = store.mark_sent(job.delivery_id, campaign_id, 1).await else {
        panic!("mark_sent failed");
    };

    // One delivery is still pending (leased, unresolved).
    let Ok(flipped) = store.finalize_completed().await else {
        panic!("finalize failed");
    };
    assert_eq!(flipped, 0);
    let Ok(Some(campaign)) = store.campaign(campaign_id).await else {
        panic!("campaign vanished");
    };
    assert_eq!(campaign.status, CampaignStatus::Sending);
}

#[tokio::test]
async fn notice_waits_for_leased_retries() {
    // next_attempt_at in the future must not let finalize jump the gun:
    // the row is pending, so the campaign stays `sending`.
    let store = Arc::new(MemoryStore::new());
    let channel = Arc::new(FakeChannel::default());
    let (seller_id, _, campaign_id) = seeded_campaign(&store, 1).await;
    let Ok(_) = store
        .grant_credits(seller_id, 1, CreditReason::AdminGrant, None)
        .await
    else {
        panic!("grant failed");
    };
    let Ok(_) = store
        .start_campaign(seller_id, campaign_id, &Default::default())
        .await
    else {
        panic!("start failed");
    };
    channel.script_failure(100, SendError::Transient("flaky".to_string()));

    let worker = Worker::new(Arc::clone(&store) as Arc<dyn Store>, Arc::clone(&channel) as Arc<dyn OutboundChannel>, test_config());
    let Ok(1) = worker.tick().await else {
        panic!("tick did not process the delivery");
    };
    let Ok(Some(campaign)) = store.campaign(campaign_id).await else {
        panic!("campaign vanished");
    };
    assert_eq!(campaign.status, CampaignStatus::Sending);
    assert!(channel.notices().is_empty());
}
