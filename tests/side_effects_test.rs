mod common;

use assert_matches::assert_matches;
use camp_checkout_api::{
    checkout::PackageType,
    entities::package_credit,
    fulfillment::{BookingWriter, ConfirmationOutcome, ConfirmationRequest, ConfirmationTrigger},
    notifications::TemplateKey,
    payments::PaymentStatus,
};
use chrono::{Duration as ChronoDuration, Utc};
use common::{cart_and_package_form, package_only_form, TestApp};
use sea_orm::{ConnectionTrait, EntityTrait, PaginatorTrait, Statement};

async fn pay_and_confirm(app: &TestApp, form: camp_checkout_api::checkout::CheckoutForm) -> ConfirmationOutcome {
    let started = app.state.checkout.start(form).await.unwrap();
    app.gateway
        .set_status(&started.payment_intent_id, PaymentStatus::Succeeded);
    app.state
        .confirmations
        .confirm(ConfirmationRequest {
            trigger: ConfirmationTrigger::Submit,
            session_token: Some(started.session_token),
            payment_intent_id: Some(started.payment_intent_id),
        })
        .await
        .unwrap()
}

async fn drop_table(app: &TestApp, table: &str) {
    let backend = app.db.get_database_backend();
    app.db
        .execute(Statement::from_string(backend, format!("DROP TABLE {table}")))
        .await
        .unwrap();
}

#[tokio::test]
async fn escrow_failure_flags_booking_but_keeps_it_confirmed() {
    let app = TestApp::new().await;
    drop_table(&app, "escrow_holds").await;

    let outcome = pay_and_confirm(&app, cart_and_package_form(app.provider_id)).await;
    let ids = assert_matches!(outcome, ConfirmationOutcome::Done(ids) => ids);

    let writer = BookingWriter::probe(&*app.db).await.unwrap();
    let booking = writer
        .fetch(&*app.db, ids.booking_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(booking.status, "confirmed");
    assert!(booking.escrow_failed);
    assert!(!booking.credits_failed);

    // Later handlers still ran.
    assert_eq!(package_credit::Entity::find().count(&*app.db).await.unwrap(), 1);
    assert_eq!(app.delivery.count(TemplateKey::GuardianBookingConfirmed), 1);
}

#[tokio::test]
async fn single_session_package_issues_no_credits() {
    let app = TestApp::new().await;
    let outcome = pay_and_confirm(
        &app,
        package_only_form(app.provider_id, PackageType::Single, 4_500),
    )
    .await;
    assert_matches!(outcome, ConfirmationOutcome::Done(ref ids) if ids.order_id.is_none());
    assert_eq!(package_credit::Entity::find().count(&*app.db).await.unwrap(), 0);
    assert_eq!(app.delivery.count(TemplateKey::AdminNewOrder), 0);
}

#[tokio::test]
async fn retail_failure_still_books_and_alerts_admin() {
    let app = TestApp::new().await;
    drop_table(&app, "order_items").await;
    drop_table(&app, "orders").await;

    let outcome = pay_and_confirm(&app, cart_and_package_form(app.provider_id)).await;
    let ids = assert_matches!(outcome, ConfirmationOutcome::Done(ids) => ids);
    assert!(ids.order_id.is_none());
    assert!(ids.booking_id.is_some());

    let fallback: Vec<_> = app
        .delivery
        .sent()
        .into_iter()
        .filter(|n| n.template == TemplateKey::AdminOrderFallback)
        .collect();
    assert_eq!(fallback.len(), 1);
    assert_eq!(fallback[0].to, "admin@camps.example.com");
}

#[tokio::test]
async fn delivery_failure_does_not_fail_confirmation() {
    let app = TestApp::new().await;
    app.delivery.set_failing(true);

    let outcome = pay_and_confirm(&app, cart_and_package_form(app.provider_id)).await;
    assert_matches!(outcome, ConfirmationOutcome::Done(_));

    // Markers are removed again so a later attempt may still notify.
    let backend = app.db.get_database_backend();
    let row = app
        .db
        .query_one(Statement::from_string(
            backend,
            "SELECT COUNT(*) AS n FROM notification_log".to_string(),
        ))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.try_get::<i64>("", "n").unwrap(), 0);
}

#[tokio::test]
async fn imminent_session_reminder_is_delivered_by_worker() {
    let app = TestApp::new().await;
    let mut form = package_only_form(app.provider_id, PackageType::FivePack, 20_000);
    if let Some(training) = form.training.as_mut() {
        training.session_start = Some(Utc::now() + ChronoDuration::hours(2));
    }
    let outcome = pay_and_confirm(&app, form).await;
    assert_matches!(outcome, ConfirmationOutcome::Done(_));
    assert_eq!(app.delivery.count(TemplateKey::GuardianSessionReminder), 0);

    let delivered = app
        .worker
        .drain_due_jobs(Utc::now() + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let reminders: Vec<_> = app
        .delivery
        .sent()
        .into_iter()
        .filter(|n| n.template == TemplateKey::GuardianSessionReminder)
        .collect();
    assert_eq!(reminders.len(), 1);
    assert_eq!(reminders[0].to, "dana.reyes@example.com");

    // Nothing left to run.
    let again = app
        .worker
        .drain_due_jobs(Utc::now() + ChronoDuration::seconds(1))
        .await
        .unwrap();
    assert_eq!(again, 0);
}
