//! Platform fee split and money conversions. Amounts are integer cents everywhere
//! except at the legacy dollar columns and in rendered notifications.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

pub const BPS_DENOMINATOR: i64 = 10_000;

/// How a booking payment divides between the platform and the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub amount_paid_cents: i64,
    pub platform_fee_cents: i64,
    pub provider_payout_cents: i64,
    pub fee_rate_bps: u32,
}

/// `fee = round_half_up(amount * bps / 10000)`, `payout = amount - fee`.
///
/// Computed once at booking creation; the rate is stored with the booking.
pub fn split(amount_paid_cents: i64, fee_rate_bps: u32) -> FeeSplit {
    let amount = amount_paid_cents.max(0);
    let bps = i64::from(fee_rate_bps.min(BPS_DENOMINATOR as u32));
    let fee = ((i128::from(amount) * i128::from(bps) + i128::from(BPS_DENOMINATOR / 2))
        / i128::from(BPS_DENOMINATOR)) as i64;
    FeeSplit {
        amount_paid_cents: amount,
        platform_fee_cents: fee,
        provider_payout_cents: amount - fee,
        fee_rate_bps: bps as u32,
    }
}

pub fn cents_to_dollars(cents: i64) -> f64 {
    Decimal::new(cents, 2).to_f64().unwrap_or(cents as f64 / 100.0)
}

pub fn dollars_to_cents(dollars: f64) -> i64 {
    Decimal::from_f64(dollars)
        .map(|d| {
            (d * Decimal::ONE_HUNDRED)
                .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        })
        .and_then(|d| d.to_i64())
        .unwrap_or(0)
}

/// Renders cents for humans, e.g. `$90.00` or `120.50 EUR`.
pub fn display_amount(cents: i64, currency: &str) -> String {
    let amount = Decimal::new(cents, 2);
    match currency.to_ascii_lowercase().as_str() {
        "usd" => format!("${amount:.2}"),
        other => format!("{amount:.2} {}", other.to_ascii_uppercase()),
    }
}
