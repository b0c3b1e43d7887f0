//! Property-based tests for money handling and claim semantics.

use std::time::Duration;

use camp_checkout_api::{
    checkout::{CartLine, FeeLine, PackageType, PriceBreakdown, TrainingSelection},
    fulfillment::fees::{cents_to_dollars, dollars_to_cents, split},
    idempotency::{intent_key, ClaimOutcome, IdempotencyLedger, InMemoryLedger},
};
use proptest::prelude::*;
use uuid::Uuid;

fn cart_strategy() -> impl Strategy<Value = Vec<CartLine>> {
    prop::collection::vec((1i32..10, 0i64..50_000), 0..5).prop_map(|lines| {
        lines
            .into_iter()
            .enumerate()
            .map(|(i, (quantity, unit_price_cents))| CartLine {
                sku: Some(format!("SKU-{i}")),
                name: format!("Item {i}"),
                quantity,
                unit_price_cents,
            })
            .collect()
    })
}

fn fee_strategy() -> impl Strategy<Value = Vec<FeeLine>> {
    prop::collection::vec(-2_000i64..5_000, 0..3).prop_map(|amounts| {
        amounts
            .into_iter()
            .map(|amount_cents| FeeLine {
                label: "Adjustment".to_string(),
                amount_cents,
            })
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn payout_plus_fee_equals_amount(amount in 0i64..100_000_000, bps in 0u32..=10_000) {
        let s = split(amount, bps);
        prop_assert_eq!(s.platform_fee_cents + s.provider_payout_cents, s.amount_paid_cents);
        prop_assert!(s.platform_fee_cents >= 0);
        prop_assert!(s.provider_payout_cents >= 0);
    }

    #[test]
    fn fee_never_decreases_with_rate(amount in 0i64..10_000_000, bps in 0u32..10_000) {
        prop_assert!(split(amount, bps).platform_fee_cents <= split(amount, bps + 1).platform_fee_cents);
    }

    #[test]
    fn legacy_dollar_columns_preserve_cents(cents in 0i64..1_000_000_000) {
        prop_assert_eq!(dollars_to_cents(cents_to_dollars(cents)), cents);
    }

    #[test]
    fn breakdown_totals_add_up(
        cart in cart_strategy(),
        fees in fee_strategy(),
        package_price in prop::option::of(0i64..200_000),
    ) {
        let training = package_price.map(|package_price_cents| TrainingSelection {
            provider_id: Uuid::nil(),
            package_type: PackageType::ThreePack,
            package_price_cents,
            session_start: None,
        });
        let b = PriceBreakdown::compute(&cart, &fees, training.as_ref());
        let cart_total: i64 = cart.iter().map(|l| i64::from(l.quantity) * l.unit_price_cents).sum();
        prop_assert_eq!(b.cart_subtotal_cents, cart_total);
        prop_assert_eq!(b.order_total_cents, b.cart_subtotal_cents + b.fees_total_cents);
        prop_assert_eq!(b.grand_total_cents, b.order_total_cents + b.training_total_cents);
    }

    #[test]
    fn only_one_claimant_wins(claimants in 2usize..12) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let ledger = InMemoryLedger::new();
            let key = intent_key("pi_prop");
            let mut claimed = 0;
            for _ in 0..claimants {
                if let ClaimOutcome::Claimed(_) = ledger.claim(&key, Duration::from_secs(60)).await.unwrap() {
                    claimed += 1;
                }
            }
            assert_eq!(claimed, 1);
        });
    }
}
