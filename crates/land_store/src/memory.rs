use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use land_proto::{
    ChangeBatch, ChangeKind, ChangeStream, Document, DocumentChange, DocumentFields, DocumentStore,
    StoreError,
};
use tracing::debug;

use crate::util::{lock, now_unix_ms};

type WatchSender = Sender<Result<ChangeBatch, StoreError>>;

#[derive(Debug, Default)]
struct StoreState {
    collections: BTreeMap<String, BTreeMap<String, Document>>,
    watchers: BTreeMap<String, Vec<WatchSender>>,
    write_counts: BTreeMap<String, u64>,
    failing_writes: BTreeSet<String>,
}

impl StoreState {
    fn write(
        &mut self,
        collection: &str,
        id: &str,
        fields: DocumentFields,
        update_time_ms: i64,
    ) -> Result<(), StoreError> {
        if self.failing_writes.contains(collection) {
            return Err(StoreError::Unavailable {
                reason: format!("writes to {collection} are failing"),
            });
        }
        let documents = self.collections.entry(collection.to_string()).or_default();
        let kind = if documents.contains_key(id) {
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };
        let document = Document {
            id: id.to_string(),
            fields,
            update_time_ms,
        };
        documents.insert(id.to_string(), document.clone());
        *self.write_counts.entry(collection.to_string()).or_insert(0) += 1;
        self.notify(
            collection,
            ChangeBatch {
                collection: collection.to_string(),
                changes: vec![DocumentChange { kind, document }],
            },
        );
        Ok(())
    }

    fn notify(&mut self, collection: &str, batch: ChangeBatch) {
        let Some(watchers) = self.watchers.get_mut(collection) else {
            return;
        };
        watchers.retain(|sender| sender.send(Ok(batch.clone())).is_ok());
    }
}

/// Process-local document store with watch support.
///
/// Cloning shares the underlying state, so a test can keep a handle for
/// inspection and fault injection while the runtime owns another.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDocumentStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a document with an explicit store timestamp.
    pub fn put_with_update_time(
        &self,
        collection: &str,
        id: &str,
        fields: DocumentFields,
        update_time_ms: i64,
    ) -> Result<(), StoreError> {
        lock(&self.state).write(collection, id, fields, update_time_ms)
    }

    /// Makes every subsequent write to `collection` fail until cleared.
    pub fn set_failing_writes(&self, collection: &str, failing: bool) {
        let mut state = lock(&self.state);
        if failing {
            state.failing_writes.insert(collection.to_string());
        } else {
            state.failing_writes.remove(collection);
        }
    }

    /// Breaks every open watch on `collection` with a stream error.
    pub fn fail_watchers(&self, collection: &str, reason: &str) {
        let mut state = lock(&self.state);
        if let Some(watchers) = state.watchers.remove(collection) {
            for sender in watchers {
                let _ = sender.send(Err(StoreError::Stream {
                    collection: collection.to_string(),
                    reason: reason.to_string(),
                }));
            }
        }
    }

    /// Number of successful writes (upserts and transactions) to `collection`.
    pub fn write_count(&self, collection: &str) -> u64 {
        lock(&self.state)
            .write_counts
            .get(collection)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn collection_documents(&self, collection: &str) -> Vec<Document> {
        lock(&self.state)
            .collections
            .get(collection)
            .map(|documents| documents.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn load_collection(&self, collection: &str, documents: Vec<Document>) {
        let mut state = lock(&self.state);
        let target = state.collections.entry(collection.to_string()).or_default();
        for document in documents {
            target.insert(document.id.clone(), document);
        }
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn watch(&self, collection: &str) -> Result<Box<dyn ChangeStream>, StoreError> {
        let (tx, rx) = mpsc::channel();
        let mut state = lock(&self.state);
        let existing: Vec<DocumentChange> = state
            .collections
            .get(collection)
            .map(|documents| {
                documents
                    .values()
                    .cloned()
                    .map(|document| DocumentChange {
                        kind: ChangeKind::Added,
                        document,
                    })
                    .collect()
            })
            .unwrap_or_default();
        if !existing.is_empty() {
            let _ = tx.send(Ok(ChangeBatch {
                collection: collection.to_string(),
                changes: existing,
            }));
        }
        state
            .watchers
            .entry(collection.to_string())
            .or_default()
            .push(tx);
        debug!(collection, "watch subscribed");
        Ok(Box::new(ChannelChangeStream {
            collection: collection.to_string(),
            rx,
        }))
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(lock(&self.state)
            .collections
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned())
    }

    fn read_all(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        Ok(self.collection_documents(collection))
    }

    fn upsert(&self, collection: &str, id: &str, fields: DocumentFields) -> Result<(), StoreError> {
        lock(&self.state).write(collection, id, fields, now_unix_ms())
    }

    fn update_in_transaction(
        &self,
        collection: &str,
        id: &str,
        update: &mut dyn FnMut(Option<&Document>) -> Result<DocumentFields, StoreError>,
    ) -> Result<(), StoreError> {
        // The whole read-modify-write runs under the store lock, so no
        // concurrent writer can interleave between read and commit.
        let mut state = lock(&self.state);
        let current = state
            .collections
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned();
        let fields = update(current.as_ref()).map_err(|err| StoreError::Transaction {
            collection: collection.to_string(),
            id: id.to_string(),
            reason: err.to_string(),
        })?;
        state.write(collection, id, fields, now_unix_ms())
    }
}

struct ChannelChangeStream {
    collection: String,
    rx: Receiver<Result<ChangeBatch, StoreError>>,
}

impl ChangeStream for ChannelChangeStream {
    fn next_batch(&mut self, wait: Duration) -> Result<Option<ChangeBatch>, StoreError> {
        match self.rx.recv_timeout(wait) {
            Ok(Ok(batch)) => Ok(Some(batch)),
            Ok(Err(err)) => Err(err),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::StreamClosed {
                collection: self.collection.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(x: f64) -> DocumentFields {
        let mut fields = DocumentFields::new();
        fields.insert("x".to_string(), serde_json::json!(x));
        fields
    }

    #[test]
    fn watch_replays_existing_documents_then_streams_changes() {
        let store = InMemoryDocumentStore::new();
        store
            .put_with_update_time("players", "p-1", fields(1.0), 10)
            .expect("seed");

        let mut stream = store.watch("players").expect("watch");
        let initial = stream
            .next_batch(Duration::from_millis(10))
            .expect("initial")
            .expect("batch");
        assert_eq!(initial.changes.len(), 1);
        assert_eq!(initial.changes[0].kind, ChangeKind::Added);
        assert_eq!(initial.changes[0].document.update_time_ms, 10);

        store.upsert("players", "p-1", fields(2.0)).expect("upsert");
        let next = stream
            .next_batch(Duration::from_millis(10))
            .expect("next")
            .expect("batch");
        assert_eq!(next.changes[0].kind, ChangeKind::Modified);
        assert_eq!(next.changes[0].document.fields["x"], serde_json::json!(2.0));

        assert_eq!(stream.next_batch(Duration::from_millis(5)).expect("idle"), None);
    }

    #[test]
    fn fail_watchers_surfaces_stream_error() {
        let store = InMemoryDocumentStore::new();
        let mut stream = store.watch("players").expect("watch");
        store.fail_watchers("players", "transport reset");
        let err = stream
            .next_batch(Duration::from_millis(10))
            .expect_err("stream failure");
        assert!(matches!(err, StoreError::Stream { .. }));
        let err = stream
            .next_batch(Duration::from_millis(10))
            .expect_err("closed");
        assert!(matches!(err, StoreError::StreamClosed { .. }));
    }

    #[test]
    fn failing_writes_are_not_counted() {
        let store = InMemoryDocumentStore::new();
        store.set_failing_writes("monsters", true);
        assert!(store.upsert("monsters", "m", fields(1.0)).is_err());
        assert_eq!(store.write_count("monsters"), 0);

        store.set_failing_writes("monsters", false);
        store.upsert("monsters", "m", fields(1.0)).expect("upsert");
        assert_eq!(store.write_count("monsters"), 1);
    }

    #[test]
    fn transaction_sees_current_document_and_replaces_it() {
        let store = InMemoryDocumentStore::new();
        let mut seed = fields(1.0);
        seed.insert("name".to_string(), serde_json::json!("alice"));
        store.upsert("users", "u-1", seed).expect("seed");

        store
            .update_in_transaction("users", "u-1", &mut |current| {
                let mut next = current.map(|doc| doc.fields.clone()).unwrap_or_default();
                next.insert("active".to_string(), serde_json::json!(true));
                Ok(next)
            })
            .expect("transaction");

        let document = store.get("users", "u-1").expect("get").expect("exists");
        assert_eq!(document.fields["name"], serde_json::json!("alice"));
        assert_eq!(document.fields["active"], serde_json::json!(true));
    }

    #[test]
    fn transaction_callback_error_aborts_without_write() {
        let store = InMemoryDocumentStore::new();
        let err = store
            .update_in_transaction("users", "u-1", &mut |_| {
                Err(StoreError::Unavailable {
                    reason: "conflict".to_string(),
                })
            })
            .expect_err("aborted");
        assert!(matches!(err, StoreError::Transaction { .. }));
        assert_eq!(store.write_count("users"), 0);
        assert!(store.get("users", "u-1").expect("get").is_none());
    }
}
