use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use vjob_models::JobRecord;

use super::StatusBackend;
use crate::error::QueueResult;

/// Process-local status records. Expired entries are purged lazily on access.
#[derive(Default)]
pub struct MemoryStatusBackend {
    records: RwLock<HashMap<String, (JobRecord, Instant)>>,
}

impl MemoryStatusBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusBackend for MemoryStatusBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, record: &JobRecord, ttl: Duration) -> QueueResult<()> {
        let now = Instant::now();
        let mut records = self.records.write().await;
        records.retain(|_, (_, expires_at)| *expires_at > now);
        records.insert(key.to_string(), (record.clone(), now + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> QueueResult<Option<JobRecord>> {
        let records = self.records.read().await;
        Ok(records
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(record, _)| record.clone()))
    }

    async fn delete(&self, key: &str) -> QueueResult<()> {
        self.records.write().await.remove(key);
        Ok(())
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}
