use super::{
    session_alias_key, ClaimOutcome, ClaimToken, FulfillmentRecord, IdempotencyLedger,
    LedgerError,
};
use std::time::Duration;
use tracing::warn;

/// Completed records are retained for this long; in-flight leases expire with their TTL.
const DONE_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

// Records the result while the caller still holds the lease, or after the lease
// expired with nobody taking it over. A key held by another claimant is left alone.
const COMPLETE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == ARGV[1] or current == false then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Ledger for deployments that already share a Redis instance. Lease expiry is left to
/// Redis key TTLs, so a stale claim disappears and the next `SET NX` wins it.
#[derive(Clone)]
pub struct RedisLedger {
    client: redis::Client,
}

impl RedisLedger {
    pub fn new(redis_url: &str) -> Result<Self, LedgerError> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
        })
    }

    fn redis_key(key: &str) -> String {
        format!("fulfillment:{key}")
    }

    fn in_flight_value(token: &str) -> String {
        format!("inflight:{token}")
    }

    fn done_value(record: &FulfillmentRecord) -> Result<String, LedgerError> {
        Ok(format!("done:{}", serde_json::to_string(record)?))
    }

    fn parse_done(key: &str, raw: &str) -> Result<Option<FulfillmentRecord>, LedgerError> {
        if raw.starts_with("inflight:") {
            return Ok(None);
        }
        match raw.strip_prefix("done:") {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Err(LedgerError::Corrupt {
                key: key.to_string(),
                reason: "unrecognized value".to_string(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl IdempotencyLedger for RedisLedger {
    async fn claim(&self, key: &str, ttl: Duration) -> Result<ClaimOutcome, LedgerError> {
        let claim = ClaimToken::issue(key);
        let mut conn = self.client.get_async_connection().await?;
        let rkey = Self::redis_key(key);

        let set: Option<String> = redis::cmd("SET")
            .arg(&rkey)
            .arg(Self::in_flight_value(&claim.token))
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        if set.is_some() {
            return Ok(ClaimOutcome::Claimed(claim));
        }

        let current: Option<String> = redis::cmd("GET").arg(&rkey).query_async(&mut conn).await?;
        match current {
            Some(raw) => match Self::parse_done(key, &raw)? {
                Some(record) => Ok(ClaimOutcome::AlreadyDone(record)),
                None => Ok(ClaimOutcome::InFlight),
            },
            // Expired or released between SET and GET; the caller's wait loop retries.
            None => Ok(ClaimOutcome::InFlight),
        }
    }

    async fn complete(
        &self,
        claim: &ClaimToken,
        record: &FulfillmentRecord,
    ) -> Result<(), LedgerError> {
        let mut conn = self.client.get_async_connection().await?;
        let done = Self::done_value(record)?;
        let retention_ms = DONE_RETENTION.as_millis() as u64;

        let swapped: i64 = redis::Script::new(COMPLETE_SCRIPT)
            .key(Self::redis_key(&claim.key))
            .arg(Self::in_flight_value(&claim.token))
            .arg(&done)
            .arg(retention_ms)
            .invoke_async(&mut conn)
            .await?;
        if swapped == 0 {
            warn!(key = %claim.key, "claim taken over before completion");
        }

        if let Some(token) = &record.session_token {
            redis::cmd("SET")
                .arg(Self::redis_key(&session_alias_key(token)))
                .arg(&done)
                .arg("PX")
                .arg(retention_ms)
                .query_async::<_, ()>(&mut conn)
                .await?;
        }
        Ok(())
    }

    async fn release(&self, claim: &ClaimToken) -> Result<(), LedgerError> {
        let mut conn = self.client.get_async_connection().await?;
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::redis_key(&claim.key))
            .arg(Self::in_flight_value(&claim.token))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn lookup(&self, key: &str) -> Result<Option<FulfillmentRecord>, LedgerError> {
        let mut conn = self.client.get_async_connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(Self::redis_key(key))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(raw) => Self::parse_done(key, &raw),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn stored_values_distinguish_in_flight_from_done() {
        let record = FulfillmentRecord {
            order_id: None,
            booking_id: None,
            booking_number: None,
            session_token: Some("cs_r".into()),
            client_secret_hash: None,
            completed_at: Utc::now(),
        };
        let done = RedisLedger::done_value(&record).unwrap();
        assert_eq!(RedisLedger::parse_done("k", &done).unwrap(), Some(record));
        assert_eq!(
            RedisLedger::parse_done("k", &RedisLedger::in_flight_value("t")).unwrap(),
            None
        );
        assert!(RedisLedger::parse_done("k", "garbage").is_err());
    }

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn record(session: &str) -> FulfillmentRecord {
        FulfillmentRecord {
            order_id: None,
            booking_id: Some(uuid::Uuid::new_v4()),
            booking_number: Some("BK-20260101-REDIS1".into()),
            session_token: Some(session.to_string()),
            client_secret_hash: None,
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn completion_after_lease_expiry_is_recorded() {
        let ledger = RedisLedger::new(&redis_url()).unwrap();
        let key = format!("intent:pi_{}", uuid::Uuid::new_v4());
        let claim = match ledger.claim(&key, Duration::from_millis(50)).await.unwrap() {
            ClaimOutcome::Claimed(claim) => claim,
            other => panic!("expected claim, got {other:?}"),
        };
        tokio::time::sleep(Duration::from_millis(120)).await;

        let rec = record(&format!("cs_{}", uuid::Uuid::new_v4()));
        ledger.complete(&claim, &rec).await.unwrap();
        assert_eq!(ledger.lookup(&key).await.unwrap(), Some(rec.clone()));
        assert!(matches!(
            ledger.claim(&key, Duration::from_secs(5)).await.unwrap(),
            ClaimOutcome::AlreadyDone(r) if r == rec
        ));
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn completion_does_not_overwrite_a_new_holder() {
        let ledger = RedisLedger::new(&redis_url()).unwrap();
        let key = format!("intent:pi_{}", uuid::Uuid::new_v4());
        let stale = match ledger.claim(&key, Duration::from_millis(50)).await.unwrap() {
            ClaimOutcome::Claimed(claim) => claim,
            other => panic!("expected claim, got {other:?}"),
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(
            ledger.claim(&key, Duration::from_secs(5)).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));

        ledger.complete(&stale, &record("cs_stale")).await.unwrap();
        assert_eq!(ledger.lookup(&key).await.unwrap(), None);
    }
}
