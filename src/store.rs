//! VM record store: the source of truth for `VmRecord`s.
//!
//! The engine persists every status transition through this interface; the
//! UI layer observes the store for listings. Kept deliberately narrow —
//! plain CRUD, no queries.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::model::VmRecord;

/// Narrow CRUD interface over VM records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn list(&self) -> Result<Vec<VmRecord>>;
    async fn get(&self, id: &str) -> Result<Option<VmRecord>>;
    async fn insert(&self, record: VmRecord) -> Result<()>;
    async fn update(&self, record: VmRecord) -> Result<()>;
    async fn delete(&self, id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

/// File-backed store keeping all records in a single JSON document.
///
/// The whole file is rewritten on every mutation. Fine for the handful of
/// records this tool manages; not a database.
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<Vec<VmRecord>>,
}

impl JsonFileStore {
    pub async fn open(path: PathBuf) -> Result<Self> {
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing record store {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "record store file absent, starting empty");
                Vec::new()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading record store {}", path.display()));
            }
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    async fn save(&self, snapshot: Vec<VmRecord>) -> Result<()> {
        let json = serde_json::to_vec_pretty(&snapshot).context("serialising record store")?;
        tokio::fs::write(&self.path, json)
            .await
            .with_context(|| format!("writing record store {}", self.path.display()))
    }

    fn snapshot(&self) -> Vec<VmRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordStore for JsonFileStore {
    async fn list(&self) -> Result<Vec<VmRecord>> {
        Ok(self.snapshot())
    }

    async fn get(&self, id: &str) -> Result<Option<VmRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned())
    }

    async fn insert(&self, record: VmRecord) -> Result<()> {
        {
            let mut records = self.records.lock().unwrap();
            records.retain(|r| r.id != record.id);
            records.push(record);
        }
        self.save(self.snapshot()).await
    }

    async fn update(&self, record: VmRecord) -> Result<()> {
        {
            let mut records = self.records.lock().unwrap();
            match records.iter_mut().find(|r| r.id == record.id) {
                Some(slot) => *slot = record,
                None => anyhow::bail!("no record with id {}", record.id),
            }
        }
        self.save(self.snapshot()).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.lock().unwrap().retain(|r| r.id != id);
        self.save(self.snapshot()).await
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Volatile store used by tests and `--ephemeral` runs.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, VmRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn list(&self) -> Result<Vec<VmRecord>> {
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<VmRecord>> {
        Ok(self.records.lock().unwrap().get(id).cloned())
    }

    async fn insert(&self, record: VmRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn update(&self, record: VmRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        if !records.contains_key(&record.id) {
            anyhow::bail!("no record with id {}", record.id);
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.records.lock().unwrap().remove(id);
        Ok(())
    }
}
