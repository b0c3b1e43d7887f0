use super::{
    session_alias_key, ClaimOutcome, ClaimToken, FulfillmentRecord, IdempotencyLedger,
    LedgerError,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
enum Slot {
    InFlight { token: String, expires_at: Instant },
    Done { record: FulfillmentRecord, recorded_at: Instant },
}

impl Slot {
    fn done(record: &FulfillmentRecord) -> Self {
        Slot::Done {
            record: record.clone(),
            recorded_at: Instant::now(),
        }
    }

    /// Expired leases and completions older than `retention` can be dropped.
    fn is_live(&self, now: Instant, retention: Duration) -> bool {
        match self {
            Slot::InFlight { expires_at, .. } => *expires_at > now,
            Slot::Done { recorded_at, .. } => now.duration_since(*recorded_at) < retention,
        }
    }
}

/// Single-process ledger for tests and one-node deployments. Completed records are
/// kept for the retention window (24h by default) and swept on each claim.
#[derive(Debug, Clone)]
pub struct InMemoryLedger {
    slots: Arc<DashMap<String, Slot>>,
    retention: Duration,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            retention,
        }
    }

    fn sweep(&self, now: Instant) {
        self.slots.retain(|_, slot| slot.is_live(now, self.retention));
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait::async_trait]
impl IdempotencyLedger for InMemoryLedger {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<ClaimOutcome, LedgerError> {
        let now = Instant::now();
        self.sweep(now);
        let claim = ClaimToken::issue(key);
        let fresh = Slot::InFlight {
            token: claim.token.clone(),
            expires_at: now + ttl,
        };

        let outcome = match self.slots.entry(key.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                ClaimOutcome::Claimed(claim)
            }
            Entry::Occupied(mut occupied) => match occupied.get() {
                Slot::Done { record, .. } => ClaimOutcome::AlreadyDone(record.clone()),
                Slot::InFlight { expires_at, .. } if *expires_at > now => ClaimOutcome::InFlight,
                Slot::InFlight { .. } => {
                    occupied.insert(fresh);
                    ClaimOutcome::Claimed(claim)
                }
            },
        };
        Ok(outcome)
    }

    async fn complete(
        &self,
        claim: &ClaimToken,
        record: &FulfillmentRecord,
    ) -> Result<(), LedgerError> {
        match self.slots.entry(claim.key.clone()) {
            Entry::Occupied(mut occupied) => {
                let held = matches!(occupied.get(), Slot::InFlight { token, .. } if *token == claim.token);
                if held {
                    occupied.insert(Slot::done(record));
                } else {
                    warn!(key = %claim.key, "claim taken over before completion");
                }
            }
            // Swept after the lease lapsed and nobody claimed it since.
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::done(record));
            }
        }

        if let Some(session_token) = &record.session_token {
            self.slots
                .insert(session_alias_key(session_token), Slot::done(record));
        }
        Ok(())
    }

    async fn release(&self, claim: &ClaimToken) -> Result<(), LedgerError> {
        self.slots.remove_if(&claim.key, |_, slot| {
            matches!(slot, Slot::InFlight { token, .. } if *token == claim.token)
        });
        Ok(())
    }

    async fn lookup(&self, key: &str) -> Result<Option<FulfillmentRecord>, LedgerError> {
        Ok(self.slots.get(key).and_then(|slot| match &*slot {
            Slot::Done { record, .. } => Some(record.clone()),
            Slot::InFlight { .. } => None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use uuid::Uuid;

    fn record() -> FulfillmentRecord {
        FulfillmentRecord {
            order_id: None,
            booking_id: Some(Uuid::new_v4()),
            booking_number: Some("BK-20260101-ABC123".into()),
            session_token: Some("cs_1".into()),
            client_secret_hash: None,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn second_claim_sees_in_flight_then_done() {
        let ledger = InMemoryLedger::new();
        let ttl = Duration::from_secs(60);

        let claim = assert_matches!(
            ledger.claim("intent:pi_1", ttl).await.unwrap(),
            ClaimOutcome::Claimed(c) => c
        );
        assert_eq!(
            ledger.claim("intent:pi_1", ttl).await.unwrap(),
            ClaimOutcome::InFlight
        );

        let rec = record();
        ledger.complete(&claim, &rec).await.unwrap();
        assert_eq!(
            ledger.claim("intent:pi_1", ttl).await.unwrap(),
            ClaimOutcome::AlreadyDone(rec.clone())
        );
        assert_eq!(ledger.lookup("session:cs_1").await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn release_only_with_matching_token() {
        let ledger = InMemoryLedger::new();
        let ttl = Duration::from_secs(60);
        let claim = assert_matches!(
            ledger.claim("k", ttl).await.unwrap(),
            ClaimOutcome::Claimed(c) => c
        );

        let stranger = ClaimToken {
            key: "k".into(),
            token: "not-mine".into(),
        };
        ledger.release(&stranger).await.unwrap();
        assert_eq!(ledger.claim("k", ttl).await.unwrap(), ClaimOutcome::InFlight);

        ledger.release(&claim).await.unwrap();
        assert_matches!(ledger.claim("k", ttl).await.unwrap(), ClaimOutcome::Claimed(_));
    }

    #[tokio::test]
    async fn stale_claim_is_taken_over_and_old_holder_cannot_complete() {
        let ledger = InMemoryLedger::new();
        let stale = assert_matches!(
            ledger.claim("k", Duration::from_millis(5)).await.unwrap(),
            ClaimOutcome::Claimed(c) => c
        );
        tokio::time::sleep(Duration::from_millis(15)).await;

        let fresh = assert_matches!(
            ledger.claim("k", Duration::from_secs(60)).await.unwrap(),
            ClaimOutcome::Claimed(c) => c
        );
        assert_ne!(stale.token, fresh.token);

        let mut rec = record();
        rec.session_token = None;
        ledger.complete(&stale, &rec).await.unwrap();
        assert_eq!(ledger.lookup("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn completed_records_are_swept_after_retention() {
        let ledger = InMemoryLedger::with_retention(Duration::from_millis(20));
        let claim = assert_matches!(
            ledger.claim("intent:pi_old", Duration::from_secs(60)).await.unwrap(),
            ClaimOutcome::Claimed(c) => c
        );
        ledger.complete(&claim, &record()).await.unwrap();
        assert_eq!(ledger.len(), 2);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_matches!(
            ledger.claim("intent:pi_new", Duration::from_secs(60)).await.unwrap(),
            ClaimOutcome::Claimed(_)
        );
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.lookup("session:cs_1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn completion_after_lapsed_lease_is_recorded() {
        let ledger = InMemoryLedger::new();
        let claim = assert_matches!(
            ledger.claim("intent:pi_slow", Duration::from_millis(5)).await.unwrap(),
            ClaimOutcome::Claimed(c) => c
        );
        tokio::time::sleep(Duration::from_millis(15)).await;
        // An unrelated claim sweeps the lapsed lease away.
        ledger.claim("intent:pi_other", Duration::from_secs(60)).await.unwrap();

        let rec = record();
        ledger.complete(&claim, &rec).await.unwrap();
        assert_eq!(
            ledger.claim("intent:pi_slow", Duration::from_secs(60)).await.unwrap(),
            ClaimOutcome::AlreadyDone(rec)
        );
    }
}
