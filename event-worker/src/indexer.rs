use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use event_common::event::CanonicalEvent;
use event_common::mapping::{index_body, IndexSettings};
use event_common::metrics::INDEXES_CREATED;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::store::DocumentStore;

/// Resolves the partition of an event and makes sure it exists before anything is written to it.
pub struct IndexRouter<S> {
    store: Arc<S>,
    body: Value,
    /// Partitions known to exist. Never shrinks: partitions are not deleted under a running worker.
    ensured: RwLock<HashSet<String>>,
}

impl<S: DocumentStore> IndexRouter<S> {
    pub fn new(store: Arc<S>, settings: &IndexSettings) -> Self {
        Self {
            store,
            body: index_body(settings),
            ensured: RwLock::new(HashSet::new()),
        }
    }

    pub fn resolve(&self, event: &CanonicalEvent) -> String {
        event.index_name()
    }

    fn is_ensured(&self, index: &str) -> bool {
        self.ensured
            .read()
            .map(|ensured| ensured.contains(index))
            .unwrap_or(false)
    }

    fn mark_ensured(&self, index: &str) {
        if let Ok(mut ensured) = self.ensured.write() {
            ensured.insert(index.to_owned());
        }
    }

    /// Create `index` with the event mapping unless it already exists.
    /// Losing a creation race to another worker is a success.
    pub async fn ensure(&self, index: &str) -> Result<(), StoreError> {
        if self.is_ensured(index) {
            return Ok(());
        }

        if !self.store.index_exists(index).await? {
            match self.store.create_index(index, &self.body).await {
                Ok(()) => {
                    info!(index, "created index");
                    metrics::counter!(INDEXES_CREATED).increment(1);
                }
                Err(error) if error.is_already_exists() => {
                    debug!(index, "index was created concurrently");
                }
                Err(error) => return Err(error),
            }
        }

        self.mark_ensured(index);
        Ok(())
    }
}

/// Writes events as documents keyed by their `event_id`, so a replay overwrites instead of
/// duplicating.
pub struct EventIndexer<S> {
    store: Arc<S>,
    worker_name: String,
}

impl<S: DocumentStore> EventIndexer<S> {
    pub fn new(store: Arc<S>, worker_name: &str) -> Self {
        Self {
            store,
            worker_name: worker_name.to_owned(),
        }
    }

    pub async fn upsert(&self, index: &str, event: CanonicalEvent) -> Result<(), StoreError> {
        let event_id = event.event_id.clone();
        let document = event.into_document(&self.worker_name, Utc::now());

        self.store.put_document(index, &event_id, &document).await
    }
}
