//! Context Store.
//!
//! Binds conversation turns to a caller [`Credential`], truncating from the
//! oldest turn-pair to fit a dynamic token budget. Supports `memory` and
//! `database` storage modes behind one type: the mode is a construction-time
//! decision and the contract afterward is identical.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};

use crate::types::{Credential, Message};

/// A stored conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub credential: Credential,
    pub turns: Vec<Message>,
    pub last_used: DateTime<Utc>,
    pub created: DateTime<Utc>,
}

/// Outcome of a [`ContextStore::save`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    /// Saved (possibly after truncating older turn-pairs).
    Saved { truncated_pairs: usize },
    /// The newest user+model pair alone exceeds the limit; the store left
    /// its prior state untouched. The caller may still forward the raw
    /// request without persisting.
    PairTooLarge,
}

/// Estimate a turn sequence's token cost: `len(utf8_serialized_json) / 4`.
/// Documented-inexact; callers should not assume this matches the upstream
/// tokenizer's count.
pub fn estimate_tokens(turns: &[Message]) -> usize {
    let bytes = serde_json::to_vec(turns).unwrap_or_default().len();
    (bytes / 4).max(if turns.is_empty() { 0 } else { 1 })
}

enum Backend {
    Memory {
        records: Mutex<HashMap<Credential, ConversationRecord>>,
        max_records: usize,
    },
    Sqlite(Pool<SqliteConnectionManager>),
}

pub struct ContextStore {
    backend: Backend,
    ttl: Mutex<std::time::Duration>,
}

impl ContextStore {
    pub fn memory(max_records: usize, ttl_seconds: u64) -> Self {
        Self {
            backend: Backend::Memory {
                records: Mutex::new(HashMap::new()),
                max_records,
            },
            ttl: Mutex::new(std::time::Duration::from_secs(ttl_seconds)),
        }
    }

    pub fn sqlite(pool: Pool<SqliteConnectionManager>, ttl_seconds: u64) -> Self {
        Self {
            backend: Backend::Sqlite(pool),
            ttl: Mutex::new(std::time::Duration::from_secs(ttl_seconds)),
        }
    }

    pub fn set_ttl(&self, seconds: u64) {
        *self.ttl.lock().expect("context store ttl mutex poisoned") =
            std::time::Duration::from_secs(seconds);
    }

    fn ttl(&self) -> std::time::Duration {
        *self.ttl.lock().expect("context store ttl mutex poisoned")
    }

    /// Load the stored turns for a credential, if any.
    pub async fn load(&self, credential: &Credential) -> anyhow::Result<Vec<Message>> {
        match &self.backend {
            Backend::Memory { records, .. } => {
                let records = records.lock().expect("context store mutex poisoned");
                Ok(records
                    .get(credential)
                    .map(|r| r.turns.clone())
                    .unwrap_or_default())
            }
            Backend::Sqlite(pool) => {
                let pool = pool.clone();
                let credential = credential.clone();
                tokio::task::spawn_blocking(move || super::storage::sqlite::load_context(&pool, &credential))
                    .await?
            }
        }
    }

    /// Merge `new_turns` onto the loaded record and truncate from the
    /// oldest user+model pair until the serialized estimate fits
    /// `effective_token_limit`.
    pub async fn save(
        &self,
        credential: &Credential,
        new_turns: Vec<Message>,
        effective_token_limit: usize,
    ) -> anyhow::Result<SaveOutcome> {
        let now = Utc::now();

        // A single user+model pair too large to ever fit is a no-op, even
        // against an empty history.
        if estimate_tokens(&new_turns) > effective_token_limit {
            return Ok(SaveOutcome::PairTooLarge);
        }

        match &self.backend {
            Backend::Memory {
                records,
                max_records,
            } => {
                let mut records = records.lock().expect("context store mutex poisoned");
                let existing = records.get(credential).map(|r| r.turns.clone()).unwrap_or_default();
                let (merged, truncated_pairs) =
                    merge_and_truncate(existing, new_turns, effective_token_limit);

                let created = records.get(credential).map(|r| r.created).unwrap_or(now);
                records.insert(
                    credential.clone(),
                    ConversationRecord {
                        credential: credential.clone(),
                        turns: merged,
                        last_used: now,
                        created,
                    },
                );

                if records.len() > *max_records {
                    evict_oldest(&mut records);
                }

                Ok(SaveOutcome::Saved { truncated_pairs })
            }
            Backend::Sqlite(pool) => {
                let pool = pool.clone();
                let credential = credential.clone();
                tokio::task::spawn_blocking(move || {
                    let existing = super::storage::sqlite::load_context(&pool, &credential)?;
                    let (merged, truncated_pairs) =
                        merge_and_truncate(existing, new_turns, effective_token_limit);
                    super::storage::sqlite::save_context(&pool, &credential, &merged, now)?;
                    Ok(SaveOutcome::Saved { truncated_pairs })
                })
                .await?
            }
        }
    }

    pub async fn delete(&self, credential: &Credential) -> anyhow::Result<()> {
        match &self.backend {
            Backend::Memory { records, .. } => {
                records
                    .lock()
                    .expect("context store mutex poisoned")
                    .remove(credential);
                Ok(())
            }
            Backend::Sqlite(pool) => {
                let pool = pool.clone();
                let credential = credential.clone();
                tokio::task::spawn_blocking(move || super::storage::sqlite::delete_context(&pool, &credential))
                    .await?
            }
        }
    }

    /// Remove records whose `last_used + ttl < now`.
    pub async fn sweep_expired(&self) -> anyhow::Result<usize> {
        let ttl = self.ttl();
        let now = Utc::now();
        match &self.backend {
            Backend::Memory { records, .. } => {
                let mut records = records.lock().expect("context store mutex poisoned");
                let before = records.len();
                records.retain(|_, r| {
                    now.signed_duration_since(r.last_used).to_std().unwrap_or_default() < ttl
                });
                Ok(before - records.len())
            }
            Backend::Sqlite(pool) => {
                let pool = pool.clone();
                tokio::task::spawn_blocking(move || {
                    super::storage::sqlite::sweep_expired_contexts(&pool, now, ttl)
                })
                .await?
            }
        }
    }
}

/// Enforce the configured in-memory record cap by evicting the record with
/// the oldest `last_used`.
fn evict_oldest(records: &mut HashMap<Credential, ConversationRecord>) {
    if let Some(oldest) = records
        .iter()
        .min_by_key(|(_, r)| r.last_used)
        .map(|(c, _)| c.clone())
    {
        records.remove(&oldest);
    }
}

/// Merge `new_turns` onto `existing`, then drop oldest user+model pairs
/// until the total fits `limit`. Returns `(merged, pairs_dropped)`.
fn merge_and_truncate(
    existing: Vec<Message>,
    new_turns: Vec<Message>,
    limit: usize,
) -> (Vec<Message>, usize) {
    let mut merged = existing;
    merged.extend(new_turns);

    let mut dropped = 0;
    // Turns alternate starting with User; a "pair" is two leading turns.
    while estimate_tokens(&merged) > limit && merged.len() > 2 {
        merged.drain(0..2);
        dropped += 1;
    }
    (merged, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    #[tokio::test]
    async fn save_then_load_round_trips_without_truncation() {
        let store = ContextStore::memory(100, 3600);
        let credential = Credential::new("c1");
        let turns = vec![Message::user("hi"), Message::model("hello")];
        store.save(&credential, turns.clone(), 100_000).await.unwrap();
        let loaded = store.load(&credential).await.unwrap();
        assert_eq!(loaded, turns);
    }

    #[tokio::test]
    async fn truncates_oldest_pair_first() {
        let store = ContextStore::memory(100, 3600);
        let credential = Credential::new("c1");
        let big_text = "x".repeat(400);
        // First pair: ~200 bytes -> ~50 tokens each turn.
        store
            .save(
                &credential,
                vec![Message::user(&big_text), Message::model(&big_text)],
                100_000,
            )
            .await
            .unwrap();
        // Second pair pushes estimate over a small limit, forcing truncation
        // of the first pair.
        let outcome = store
            .save(
                &credential,
                vec![Message::user("new"), Message::model("reply")],
                (big_text.len() + 50) / 4,
            )
            .await
            .unwrap();
        assert!(matches!(outcome, SaveOutcome::Saved { truncated_pairs } if truncated_pairs >= 1));
        let loaded = store.load(&credential).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], Message::user("new"));
    }

    #[tokio::test]
    async fn pair_larger_than_limit_is_not_persisted() {
        let store = ContextStore::memory(100, 3600);
        let credential = Credential::new("c1");
        let huge = "x".repeat(10_000);
        let outcome = store
            .save(&credential, vec![Message::user(&huge)], 10)
            .await
            .unwrap();
        assert_eq!(outcome, SaveOutcome::PairTooLarge);
        let loaded = store.load(&credential).await.unwrap();
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn delete_is_isolated_per_credential() {
        let store = ContextStore::memory(100, 3600);
        let c1 = Credential::new("c1");
        let c2 = Credential::new("c2");
        store
            .save(&c1, vec![Message::user("a")], 100_000)
            .await
            .unwrap();
        store
            .save(&c2, vec![Message::user("b")], 100_000)
            .await
            .unwrap();
        store.delete(&c1).await.unwrap();
        assert!(store.load(&c1).await.unwrap().is_empty());
        assert!(!store.load(&c2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn sweep_expired_removes_stale_records() {
        let store = ContextStore::memory(100, 0);
        let credential = Credential::new("c1");
        store
            .save(&credential, vec![Message::user("a")], 100_000)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let removed = store.sweep_expired().await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.load(&credential).await.unwrap().is_empty());
    }
}
