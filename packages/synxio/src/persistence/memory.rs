//! In-memory log store.
//!
//! Always available. Used by tests and by applications that do not need to
//! survive a process restart. Clones share the same rows, so a "restart" in
//! tests is a second `App` over a clone of the store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{LogRecord, LogStore, NewRecord, Position, StoreError};

/// In-memory store backed by a HashMap of per-app row vectors.
#[derive(Clone, Default)]
pub struct MemoryLogStore {
    apps: Arc<Mutex<HashMap<String, Vec<LogRecord>>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows of an app in position order.
    pub fn records(&self, app_id: &str) -> Vec<LogRecord> {
        let apps = match self.apps.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apps.get(app_id).cloned().unwrap_or_default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<LogRecord>>>, StoreError> {
        self.apps
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("mutex poisoned: {}", e)))
    }
}

impl std::fmt::Debug for MemoryLogStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let apps = self.apps.lock().map(|a| a.len()).unwrap_or(0);
        f.debug_struct("MemoryLogStore").field("apps", &apps).finish()
    }
}

fn latest_index(rows: &[LogRecord], id: &str) -> Option<usize> {
    rows.iter().rposition(|row| row.id == id)
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, app_id: &str, record: NewRecord) -> Result<Position, StoreError> {
        let mut apps = self.lock()?;
        let rows = apps.entry(app_id.to_string()).or_default();
        let position = rows
            .last()
            .map(|row| row.position)
            .unwrap_or(Position::NONE)
            .next();
        rows.push(LogRecord::from_new(app_id, position, record));
        Ok(position)
    }

    async fn get(&self, app_id: &str, id: &str) -> Result<Option<LogRecord>, StoreError> {
        let apps = self.lock()?;
        Ok(apps
            .get(app_id)
            .and_then(|rows| latest_index(rows, id).map(|i| rows[i].clone())))
    }

    async fn next_after(
        &self,
        app_id: &str,
        position: Position,
    ) -> Result<Option<LogRecord>, StoreError> {
        let apps = self.lock()?;
        Ok(apps.get(app_id).and_then(|rows| {
            rows.iter().find(|row| row.position > position).cloned()
        }))
    }
}
