pub mod checkout;
pub mod health;

pub use checkout::{checkout_routes, ConfirmationView};
pub use health::health_check;
