mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use camp_checkout_api::{
    checkout::{CheckoutDraftStore, InMemoryDraftStore},
    fulfillment::{
        BookingWriter, ConfirmationOutcome, ConfirmationRequest, ConfirmationTrigger,
        DbRetailOrders, Materializer,
    },
    idempotency::{
        intent_key, ClaimOutcome, ClaimToken, DatabaseLedger, FulfillmentRecord,
        IdempotencyLedger, LedgerError,
    },
    notifications::TemplateKey,
    payments::{PaymentGateway, PaymentStatus},
};
use common::{cart_and_package_form, setup_db, test_config, TestApp};
use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr, Statement};

/// Database ledger whose next `complete` fails while armed.
struct FailingCompleteLedger {
    inner: DatabaseLedger,
    fail_next_complete: AtomicBool,
    completes: AtomicUsize,
}

impl FailingCompleteLedger {
    fn new(db: Arc<DatabaseConnection>) -> Arc<Self> {
        Arc::new(Self {
            inner: DatabaseLedger::new(db),
            fail_next_complete: AtomicBool::new(true),
            completes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl IdempotencyLedger for FailingCompleteLedger {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<ClaimOutcome, LedgerError> {
        self.inner.claim(key, ttl).await
    }

    async fn complete(
        &self,
        claim: &ClaimToken,
        record: &FulfillmentRecord,
    ) -> Result<(), LedgerError> {
        self.completes.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_complete.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::Database(DbErr::Custom(
                "connection reset during commit".to_string(),
            )));
        }
        self.inner.complete(claim, record).await
    }

    async fn release(&self, claim: &ClaimToken) -> Result<(), LedgerError> {
        self.inner.release(claim).await
    }

    async fn lookup(&self, key: &str) -> Result<Option<FulfillmentRecord>, LedgerError> {
        self.inner.lookup(key).await
    }
}

fn request(
    trigger: ConfirmationTrigger,
    session_token: Option<&str>,
    intent_id: Option<&str>,
) -> ConfirmationRequest {
    ConfirmationRequest {
        trigger,
        session_token: session_token.map(str::to_string),
        payment_intent_id: intent_id.map(str::to_string),
    }
}

async fn count_rows(db: &DatabaseConnection, table: &str) -> i64 {
    let backend = db.get_database_backend();
    let row = db
        .query_one(Statement::from_string(
            backend,
            format!("SELECT COUNT(*) AS n FROM {table}"),
        ))
        .await
        .unwrap()
        .unwrap();
    row.try_get::<i64>("", "n").unwrap()
}

#[tokio::test]
async fn unrecorded_completion_still_returns_same_ids() {
    let db = setup_db().await;
    let cfg = test_config();
    let drafts: Arc<dyn CheckoutDraftStore> = Arc::new(InMemoryDraftStore::new(cfg.draft_ttl()));
    let ledger = FailingCompleteLedger::new(db.clone());
    let app = TestApp::with_backends(db.clone(), cfg, drafts, ledger.clone()).await;

    let started = app
        .state
        .checkout
        .start(cart_and_package_form(app.provider_id))
        .await
        .unwrap();
    app.gateway
        .set_status(&started.payment_intent_id, PaymentStatus::Succeeded);
    let submit = || {
        request(
            ConfirmationTrigger::Submit,
            Some(&started.session_token),
            Some(&started.payment_intent_id),
        )
    };

    let first = app.state.confirmations.confirm(submit()).await.unwrap();
    let ids = assert_matches!(first, ConfirmationOutcome::Done(ids) => ids);
    assert!(ids.booking_id.is_some());
    assert!(ids.order_id.is_some());

    // The draft is gone and the ledger never recorded the result; the committed
    // records are found by payment intent.
    let redirect = app
        .state
        .confirmations
        .confirm(request(
            ConfirmationTrigger::Redirect,
            Some(&started.session_token),
            Some(&started.payment_intent_id),
        ))
        .await
        .unwrap();
    assert_eq!(redirect, ConfirmationOutcome::AlreadyDone(ids.clone()));
    assert_eq!(ledger.completes.load(Ordering::SeqCst), 2);

    // Now recorded, so later calls are answered straight from the ledger.
    let again = app.state.confirmations.confirm(submit()).await.unwrap();
    assert_eq!(again, ConfirmationOutcome::AlreadyDone(ids.clone()));
    let by_session = app
        .state
        .confirmations
        .confirm(request(
            ConfirmationTrigger::Redirect,
            Some(&started.session_token),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(by_session, ConfirmationOutcome::AlreadyDone(ids));
    assert_eq!(ledger.completes.load(Ordering::SeqCst), 2);

    assert_eq!(count_rows(&db, "bookings").await, 1);
    assert_eq!(count_rows(&db, "orders").await, 1);
    assert_eq!(count_rows(&db, "escrow_holds").await, 1);
    assert_eq!(app.delivery.count(TemplateKey::ProviderNewBooking), 1);
}

#[tokio::test]
async fn crashed_holder_is_taken_over_and_its_records_reused() {
    let db = setup_db().await;
    let cfg = test_config();
    let fee_bps = cfg.platform_fee_bps;
    let drafts = Arc::new(InMemoryDraftStore::new(cfg.draft_ttl()));
    let ledger = Arc::new(DatabaseLedger::new(db.clone()));
    let app = TestApp::with_backends(db.clone(), cfg, drafts.clone(), ledger.clone()).await;

    let started = app
        .state
        .checkout
        .start(cart_and_package_form(app.provider_id))
        .await
        .unwrap();
    app.gateway
        .set_status(&started.payment_intent_id, PaymentStatus::Succeeded);

    // A holder claims with a short lease, writes the records and dies before
    // completing the claim or deleting the draft.
    let crashed_claim = assert_matches!(
        ledger
            .claim(&intent_key(&started.payment_intent_id), Duration::from_millis(50))
            .await
            .unwrap(),
        ClaimOutcome::Claimed(claim) => claim
    );
    let draft = drafts.load(&started.session_token).await.unwrap().unwrap();
    let evidence = app.gateway.get_intent(&started.payment_intent_id).await.unwrap();
    let materializer = Materializer::new(
        db.clone(),
        Arc::new(DbRetailOrders::new(db.clone())),
        Arc::new(BookingWriter::probe(db.as_ref()).await.unwrap()),
        fee_bps,
    );
    let crashed = materializer.materialize(&draft, &evidence).await.unwrap();
    assert_eq!(count_rows(&db, "bookings").await, 1);

    // While the lease is live, another trigger cannot take over.
    assert_eq!(
        ledger
            .claim(&intent_key(&started.payment_intent_id), Duration::from_secs(60))
            .await
            .unwrap(),
        ClaimOutcome::InFlight
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = app
        .state
        .confirmations
        .confirm(request(
            ConfirmationTrigger::Redirect,
            Some(&started.session_token),
            Some(&started.payment_intent_id),
        ))
        .await
        .unwrap();
    assert_eq!(outcome, ConfirmationOutcome::Done(crashed.ids.clone()));

    let repeat = app
        .state
        .confirmations
        .confirm(request(
            ConfirmationTrigger::ClientConfirm,
            Some(&started.session_token),
            Some(&started.payment_intent_id),
        ))
        .await
        .unwrap();
    assert_eq!(repeat, ConfirmationOutcome::AlreadyDone(crashed.ids));

    // The dead holder's token no longer completes anything.
    assert!(ledger.release(&crashed_claim).await.is_ok());
    assert_matches!(
        ledger
            .claim(&intent_key(&started.payment_intent_id), Duration::from_secs(60))
            .await
            .unwrap(),
        ClaimOutcome::AlreadyDone(_)
    );

    assert_eq!(count_rows(&db, "bookings").await, 1);
    assert_eq!(count_rows(&db, "orders").await, 1);
    assert_eq!(count_rows(&db, "escrow_holds").await, 1);
    assert_eq!(count_rows(&db, "package_credits").await, 1);
}
