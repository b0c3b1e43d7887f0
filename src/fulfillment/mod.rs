//! From verified payment to durable records.

pub mod booking_writer;
pub mod fees;
pub mod materializer;
pub mod retail;
pub mod router;

pub use booking_writer::{BookingLayout, BookingStatus, BookingWriter, SchemaError, SideEffectFlag};
pub use materializer::{FulfillmentIds, Materialized, Materializer};
pub use retail::{DbRetailOrders, RetailOrderRequest, RetailOrderReceipt, RetailOrderService};
pub use router::{
    ConfirmationOutcome, ConfirmationRequest, ConfirmationService, ConfirmationSettings,
    ConfirmationTrigger,
};
