//! Draft persistence. Drafts live only between checkout start and confirmation, so
//! both backends are TTL stores.

use super::draft::CheckoutDraft;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DraftStoreError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Draft store operation failed: {0}")]
    Backend(String),
}

#[async_trait::async_trait]
pub trait CheckoutDraftStore: Send + Sync {
    async fn save(&self, draft: &CheckoutDraft) -> Result<(), DraftStoreError>;
    /// Returns `None` for unknown or expired tokens.
    async fn load(&self, session_token: &str) -> Result<Option<CheckoutDraft>, DraftStoreError>;
    /// Deleting an absent draft is not an error.
    async fn delete(&self, session_token: &str) -> Result<(), DraftStoreError>;
}

fn draft_key(session_token: &str) -> String {
    format!("checkout:draft:{session_token}")
}

#[derive(Debug, Clone)]
struct DraftEntry {
    value: String,
    expires_at: Instant,
}

impl DraftEntry {
    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// Process-local store used in development and tests.
#[derive(Debug, Clone)]
pub struct InMemoryDraftStore {
    entries: Arc<RwLock<HashMap<String, DraftEntry>>>,
    ttl: Duration,
}

impl InMemoryDraftStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    fn poisoned<T>(_: T) -> DraftStoreError {
        DraftStoreError::Backend("draft store lock poisoned".to_string())
    }
}

#[async_trait::async_trait]
impl CheckoutDraftStore for InMemoryDraftStore {
    async fn save(&self, draft: &CheckoutDraft) -> Result<(), DraftStoreError> {
        let value = serde_json::to_string(draft)?;
        let mut entries = self.entries.write().map_err(Self::poisoned)?;
        entries.retain(|_, e| !e.is_expired());
        entries.insert(
            draft_key(&draft.session_token),
            DraftEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn load(&self, session_token: &str) -> Result<Option<CheckoutDraft>, DraftStoreError> {
        let key = draft_key(session_token);
        let value = {
            let entries = self.entries.read().map_err(Self::poisoned)?;
            match entries.get(&key) {
                Some(entry) if !entry.is_expired() => Some(entry.value.clone()),
                _ => None,
            }
        };
        match value {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, session_token: &str) -> Result<(), DraftStoreError> {
        let mut entries = self.entries.write().map_err(Self::poisoned)?;
        entries.remove(&draft_key(session_token));
        Ok(())
    }
}

/// Shared store for multi-instance deployments.
#[derive(Clone)]
pub struct RedisDraftStore {
    client: redis::Client,
    ttl: Duration,
}

impl RedisDraftStore {
    pub fn new(redis_url: &str, ttl: Duration) -> Result<Self, DraftStoreError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client, ttl })
    }
}

#[async_trait::async_trait]
impl CheckoutDraftStore for RedisDraftStore {
    async fn save(&self, draft: &CheckoutDraft) -> Result<(), DraftStoreError> {
        let value = serde_json::to_string(draft)?;
        let mut conn = self.client.get_async_connection().await?;
        redis::cmd("SET")
            .arg(draft_key(&draft.session_token))
            .arg(value)
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn load(&self, session_token: &str) -> Result<Option<CheckoutDraft>, DraftStoreError> {
        let mut conn = self.client.get_async_connection().await?;
        let raw: Option<String> = redis::cmd("GET")
            .arg(draft_key(session_token))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, session_token: &str) -> Result<(), DraftStoreError> {
        let mut conn = self.client.get_async_connection().await?;
        redis::cmd("DEL")
            .arg(draft_key(session_token))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::draft::{GuardianInfo, PriceBreakdown};
    use chrono::Utc;

    fn draft(token: &str) -> CheckoutDraft {
        CheckoutDraft {
            session_token: token.to_string(),
            guardian: GuardianInfo {
                first_name: "Dana".into(),
                last_name: "Reyes".into(),
                email: "dana@example.com".into(),
                phone: None,
            },
            emergency_contact: None,
            medical_notes: None,
            minors: vec![],
            cart: vec![],
            fees: vec![],
            training: None,
            breakdown: PriceBreakdown::default(),
            currency: "usd".into(),
            payment_intent_id: Some("pi_1".into()),
            client_secret_hash: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_load_delete() {
        let store = InMemoryDraftStore::new(Duration::from_secs(60));
        store.save(&draft("cs_a")).await.unwrap();

        let loaded = store.load("cs_a").await.unwrap().unwrap();
        assert_eq!(loaded.payment_intent_id.as_deref(), Some("pi_1"));
        assert!(store.load("cs_b").await.unwrap().is_none());

        store.delete("cs_a").await.unwrap();
        store.delete("cs_a").await.unwrap();
        assert!(store.load("cs_a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_drafts_are_invisible() {
        let store = InMemoryDraftStore::new(Duration::from_millis(10));
        store.save(&draft("cs_x")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(store.load("cs_x").await.unwrap().is_none());
    }
}
