//! Memory persistence.
//!
//! Captured objects become memory records: the frame, the analyzer's
//! description, and whatever the user said about it. Two backends share the
//! trait: a REST store for the hosted service and an append-only JSONL file
//! for running without one.

use crate::error::{LiveError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

/// One remembered object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecord {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Base64 JPEG of the captured frame.
    pub image: String,
    /// Analyzer's description of the object.
    pub description: String,
    /// What the user said to remember, or the placeholder when they said
    /// nothing usable.
    pub memory_text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn new(
        session_id: Uuid,
        image: String,
        description: String,
        memory_text: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            session_id,
            image,
            description,
            memory_text,
            created_at: now,
            updated_at: now,
        }
    }
}

#[async_trait]
pub trait MemoryStore: Send {
    async fn insert(&self, record: &MemoryRecord) -> Result<()>;
    async fn update(&self, record: &MemoryRecord) -> Result<()>;
    async fn list_by_session(&self, session_id: Uuid) -> Result<Vec<MemoryRecord>>;
}

/// REST-backed store speaking JSON to a memories endpoint.
pub struct RestMemoryStore {
    http: reqwest::Client,
    base_url: String,
}

impl RestMemoryStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn check(status: reqwest::StatusCode) -> Result<()> {
        if status.is_success() {
            Ok(())
        } else {
            Err(LiveError::Persistence(format!("store replied {status}")))
        }
    }
}

#[async_trait]
impl MemoryStore for RestMemoryStore {
    async fn insert(&self, record: &MemoryRecord) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/memories", self.base_url))
            .json(record)
            .send()
            .await
            .map_err(|e| LiveError::Persistence(e.to_string()))?;
        Self::check(resp.status())
    }

    async fn update(&self, record: &MemoryRecord) -> Result<()> {
        let resp = self
            .http
            .patch(format!("{}/memories/{}", self.base_url, record.id))
            .json(record)
            .send()
            .await
            .map_err(|e| LiveError::Persistence(e.to_string()))?;
        Self::check(resp.status())
    }

    async fn list_by_session(&self, session_id: Uuid) -> Result<Vec<MemoryRecord>> {
        let resp = self
            .http
            .get(format!("{}/memories", self.base_url))
            .query(&[("sessionId", session_id.to_string())])
            .send()
            .await
            .map_err(|e| LiveError::Persistence(e.to_string()))?;
        Self::check(resp.status())?;
        resp.json()
            .await
            .map_err(|e| LiveError::Persistence(e.to_string()))
    }
}

/// Append-only JSONL file store. An update appends a newer row with the same
/// id; reads keep only the latest row per id.
pub struct JsonlMemoryStore {
    path: PathBuf,
}

impl JsonlMemoryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn append(&self, record: &MemoryRecord) -> Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LiveError::Persistence(e.to_string()))?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}").map_err(|e| LiveError::Persistence(e.to_string()))?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<MemoryRecord>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LiveError::Persistence(e.to_string())),
        };
        let mut latest: Vec<MemoryRecord> = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let record: MemoryRecord = serde_json::from_str(line)?;
            match latest.iter_mut().find(|r| r.id == record.id) {
                Some(slot) => *slot = record,
                None => latest.push(record),
            }
        }
        Ok(latest)
    }
}

#[async_trait]
impl MemoryStore for JsonlMemoryStore {
    async fn insert(&self, record: &MemoryRecord) -> Result<()> {
        self.append(record)?;
        info!("memory {} saved", record.id);
        Ok(())
    }

    async fn update(&self, record: &MemoryRecord) -> Result<()> {
        self.append(record)
    }

    async fn list_by_session(&self, session_id: Uuid) -> Result<Vec<MemoryRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.session_id == session_id)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(session_id: Uuid, text: &str) -> MemoryRecord {
        MemoryRecord::new(
            session_id,
            "aW1n".to_string(),
            "a red bicycle".to_string(),
            text.to_string(),
        )
    }

    #[tokio::test]
    async fn jsonl_insert_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMemoryStore::new(dir.path().join("memories.jsonl"));
        let session = Uuid::new_v4();

        store.insert(&record(session, "grandpa's bike")).await.unwrap();
        store.insert(&record(session, "the other one")).await.unwrap();
        store.insert(&record(Uuid::new_v4(), "elsewhere")).await.unwrap();

        let rows = store.list_by_session(session).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].memory_text, "grandpa's bike");
    }

    #[tokio::test]
    async fn jsonl_update_keeps_latest_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMemoryStore::new(dir.path().join("memories.jsonl"));
        let session = Uuid::new_v4();

        let mut rec = record(session, "first draft");
        store.insert(&rec).await.unwrap();
        rec.memory_text = "final wording".to_string();
        rec.updated_at = Utc::now();
        store.update(&rec).await.unwrap();

        let rows = store.list_by_session(session).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].memory_text, "final wording");
    }

    #[tokio::test]
    async fn missing_file_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlMemoryStore::new(dir.path().join("nope.jsonl"));
        let rows = store.list_by_session(Uuid::new_v4()).await.unwrap();
        assert!(rows.is_empty());
    }
}
