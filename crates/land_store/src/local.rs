use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use land_proto::{ChangeStream, Document, DocumentFields, DocumentStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::memory::InMemoryDocumentStore;
use crate::util::lock;

const COLLECTION_FILE_EXTENSION: &str = "json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct CollectionFile {
    collection: String,
    documents: Vec<Document>,
}

/// Durable variant of [`InMemoryDocumentStore`]: every collection is mirrored
/// to `<root>/<collection>.json` after each successful write.
///
/// The files are read once, at [`LocalDocumentStore::open`]. Later edits made
/// by other processes are not picked up, so change streams only carry writes
/// made through this store.
#[derive(Debug, Clone)]
pub struct LocalDocumentStore {
    root: PathBuf,
    inner: InMemoryDocumentStore,
    /// Held from snapshot to rename so concurrent writers never share a tmp
    /// file or land an older snapshot last.
    persist_lock: Arc<Mutex<()>>,
}

impl LocalDocumentStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let inner = InMemoryDocumentStore::new();
        let mut loaded = 0_usize;
        for entry in fs::read_dir(&root)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(COLLECTION_FILE_EXTENSION) {
                continue;
            }
            let file: CollectionFile = read_json_from_path(&path)?;
            loaded += file.documents.len();
            inner.load_collection(file.collection.as_str(), file.documents);
        }
        info!(root = %root.display(), documents = loaded, "local document store opened");
        Ok(Self {
            root,
            inner,
            persist_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn collection_path(&self, collection: &str) -> PathBuf {
        self.root
            .join(format!("{}.{COLLECTION_FILE_EXTENSION}", file_stem(collection)))
    }

    /// Shared in-memory view, useful for inspection and fault injection.
    pub fn memory(&self) -> &InMemoryDocumentStore {
        &self.inner
    }

    fn persist(&self, collection: &str) -> Result<(), StoreError> {
        let _guard = lock(&self.persist_lock);
        let file = CollectionFile {
            collection: collection.to_string(),
            documents: self.inner.collection_documents(collection),
        };
        write_json_atomic(&file, &self.collection_path(collection))
    }
}

impl DocumentStore for LocalDocumentStore {
    fn watch(&self, collection: &str) -> Result<Box<dyn ChangeStream>, StoreError> {
        self.inner.watch(collection)
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.inner.get(collection, id)
    }

    fn read_all(&self, collection: &str) -> Result<Vec<Document>, StoreError> {
        self.inner.read_all(collection)
    }

    fn upsert(&self, collection: &str, id: &str, fields: DocumentFields) -> Result<(), StoreError> {
        self.inner.upsert(collection, id, fields)?;
        self.persist(collection)
    }

    fn update_in_transaction(
        &self,
        collection: &str,
        id: &str,
        update: &mut dyn FnMut(Option<&Document>) -> Result<DocumentFields, StoreError>,
    ) -> Result<(), StoreError> {
        self.inner.update_in_transaction(collection, id, update)?;
        self.persist(collection)
    }
}

fn file_stem(collection: &str) -> String {
    collection
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn write_json_atomic<T: Serialize>(value: &T, path: &Path) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    let bytes = serde_json::to_vec_pretty(value).map_err(|err| StoreError::Encode {
        message: err.to_string(),
    })?;
    fs::write(&tmp, bytes)?;
    fs::rename(tmp, path)?;
    Ok(())
}

fn read_json_from_path<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|err| StoreError::Io {
        reason: format!("parse {} failed: {err}", path.display()),
    })
}
