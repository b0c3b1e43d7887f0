//! Money held on behalf of providers and prepaid session credits.

pub mod credits;
pub mod holds;

pub use credits::{CreditIssue, PackageCreditService};
pub use holds::EscrowService;
