//! # loyalty-engine
//!
//! Campaign delivery engine for a merchant loyalty messaging platform.
//!
//! Sellers spend pre-purchased sending credits to broadcast a paid
//! campaign to every customer subscribed to one of their shops. This
//! crate owns the credit ledger, the campaign state machine, the
//! lease-based delivery queue and completion detection; the chat UI,
//! payment checkout and shop/audience CRUD are external collaborators.
//!
//! ## Architecture
//!
//! ```text
//! Payment events, "send now" actions
//!     │
//!     ├── Ledger (grant / spend, store/)
//!     ├── Campaign start (fan-out, store/)
//!     │
//!     ├── Delivery queue (lease / reschedule, store/)
//!     ├── Worker loop (worker/)
//!     │
//!     ├── OutboundChannel (channel.rs)
//!     └── PostgreSQL (store/postgres.rs)
//! ```
//!
//! ## Guarantees
//!
//! - At-least-once delivery enqueuing with idempotent crediting
//! - No double-spend: balance changes are single conditional updates
//! - Leased rows recover automatically after a worker crash
//! - Exactly one confirmed completion notice per campaign
//!
//! ## Non-guarantees
//!
//! - Exactly-once delivery on the outbound channel
//! - Delivery ordering beyond best-effort FIFO by due time

pub mod channel;
pub mod config;
pub mod domain;
pub mod error;
pub mod store;
pub mod worker;

pub use channel::{CompletionNotice, DryRunChannel, OutboundChannel};
pub use config::EngineConfig;
pub use domain::{
    AudienceSnapshot, Campaign, CampaignStatus, CompletedCampaign, CreditReason,
    CreditTransaction, Delivery, DeliveryJob, DeliveryStatus, DeliverySummary, SellerCredit,
    StartPolicy,
};
pub use error::{LedgerError, SendError, StartError, StoreError};
pub use store::{MemoryStore, PgStore, Store};
pub use worker::{Worker, WorkerConfig, retry_delay};
