//! Payment provider boundary. The rest of the crate only sees [`PaymentGateway`].

pub mod gateway;
pub mod http;

pub use gateway::{
    CreatedIntent, GatewayError, PaymentEvidence, PaymentGateway, PaymentStatus,
};
pub use http::{HttpPaymentGateway, HttpPaymentGatewayConfig};
