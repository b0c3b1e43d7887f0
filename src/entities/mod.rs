//! SeaORM entities for the checkout and fulfillment tables.
//!
//! Bookings are intentionally absent: their column set differs between deployments and
//! they are written through `fulfillment::booking_writer`.

pub mod account;
pub mod escrow_hold;
pub mod fulfillment_claim;
pub mod guardian;
pub mod minor;
pub mod notification_log;
pub mod order;
pub mod order_item;
pub mod package_credit;
pub mod provider;
pub mod scheduled_job;
