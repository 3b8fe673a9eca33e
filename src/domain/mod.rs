//! Domain types: campaign and delivery state machines, credit ledger rows.
//!
//! Statuses are closed enums stored as strings, with explicit transition
//! validation on [`CampaignStatus`].

pub mod campaign;
pub mod credit;
pub mod delivery;

pub use campaign::{
    AudienceSnapshot, Campaign, CampaignStatus, CompletedCampaign, DeliverySummary, StartPolicy,
};
pub use credit::{CreditReason, CreditTransaction, SellerCredit};
pub use delivery::{Delivery, DeliveryJob, DeliveryStatus, truncate_error};
