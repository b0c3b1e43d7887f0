//! Pre-payment checkout state: the normalized draft, its TTL store and the service
//! that opens a payment intent for it.

pub mod draft;
pub mod service;
pub mod store;

pub use draft::{
    CartLine, CheckoutDraft, EmergencyContact, FeeLine, GuardianInfo, MinorInfo, PackageType,
    PriceBreakdown, TrainingSelection,
};
pub use service::{CheckoutForm, CheckoutService, CheckoutStarted};
pub use store::{CheckoutDraftStore, DraftStoreError, InMemoryDraftStore, RedisDraftStore};
