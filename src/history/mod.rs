//! Search history: one audit record per executed search.

mod postgres;

pub use postgres::PostgresHistoryStore;

use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::search::SearchType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRecord {
    pub id: Uuid,
    pub session_id: String,
    pub user_id: Option<String>,
    pub query: String,
    pub search_type: SearchType,
    pub category: Option<String>,
    pub country: String,
    pub result_count: usize,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait HistoryStore: Send + Sync + std::fmt::Debug {
    async fn record(&self, record: SearchRecord) -> Result<()>;

    /// Most recent records for a user, newest first.
    async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<SearchRecord>>;
}

/// Bounded in-process history, used when no database is configured.
#[derive(Debug)]
pub struct MemoryHistoryStore {
    records: Mutex<VecDeque<SearchRecord>>,
    capacity: usize,
}

impl Default for MemoryHistoryStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl MemoryHistoryStore {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn record(&self, record: SearchRecord) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("history lock poisoned: {e}"))?;
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
        Ok(())
    }

    async fn recent(&self, user_id: &str, limit: usize) -> Result<Vec<SearchRecord>> {
        let records = self
            .records
            .lock()
            .map_err(|e| anyhow::anyhow!("history lock poisoned: {e}"))?;
        Ok(records
            .iter()
            .rev()
            .filter(|r| r.user_id.as_deref() == Some(user_id))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user: Option<&str>, query: &str) -> SearchRecord {
        SearchRecord {
            id: Uuid::new_v4(),
            session_id: "sess_1_a".into(),
            user_id: user.map(ToString::to_string),
            query: query.into(),
            search_type: SearchType::Default,
            category: None,
            country: "us".into(),
            result_count: 3,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_recent_is_newest_first_per_user() {
        let store = MemoryHistoryStore::default();
        store.record(record(Some("u1"), "a")).await.unwrap();
        store.record(record(Some("u2"), "b")).await.unwrap();
        store.record(record(Some("u1"), "c")).await.unwrap();
        store.record(record(None, "d")).await.unwrap();

        let recent = store.recent("u1", 10).await.unwrap();
        let queries: Vec<&str> = recent.iter().map(|r| r.query.as_str()).collect();
        assert_eq!(queries, vec!["c", "a"]);
        assert_eq!(store.recent("u1", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_drops_oldest() {
        let store = MemoryHistoryStore::new(2);
        for q in ["a", "b", "c"] {
            store.record(record(Some("u1"), q)).await.unwrap();
        }
        assert_eq!(store.len(), 2);
        let recent = store.recent("u1", 10).await.unwrap();
        assert_eq!(recent.last().unwrap().query, "b");
    }
}
