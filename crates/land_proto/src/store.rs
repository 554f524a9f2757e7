//! Document store boundary: watch, point read, upsert, read-modify-write.

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub type DocumentFields = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: DocumentFields,
    /// The store's own last-write timestamp.
    pub update_time_ms: i64,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self, collection: &str) -> Result<T, StoreError> {
        decode_fields(&self.fields).map_err(|message| StoreError::Decode {
            collection: collection.to_string(),
            id: self.id.clone(),
            message,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: Document,
}

/// Ordered set of changes delivered by one watch notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub collection: String,
    pub changes: Vec<DocumentChange>,
}

pub trait ChangeStream: Send {
    /// Waits up to `wait` for the next batch. `Ok(None)` means nothing
    /// arrived in time; an `Err` ends the stream.
    fn next_batch(&mut self, wait: Duration) -> Result<Option<ChangeBatch>, StoreError>;
}

pub trait DocumentStore: Send + Sync {
    fn watch(&self, collection: &str) -> Result<Box<dyn ChangeStream>, StoreError>;
    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;
    fn read_all(&self, collection: &str) -> Result<Vec<Document>, StoreError>;
    fn upsert(&self, collection: &str, id: &str, fields: DocumentFields) -> Result<(), StoreError>;
    /// Optimistic read-modify-write of a single document. `update` sees the
    /// current document (if any) and returns the replacement fields.
    fn update_in_transaction(
        &self,
        collection: &str,
        id: &str,
        update: &mut dyn FnMut(Option<&Document>) -> Result<DocumentFields, StoreError>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    Unavailable { reason: String },
    Stream { collection: String, reason: String },
    StreamClosed { collection: String },
    Transaction { collection: String, id: String, reason: String },
    Decode { collection: String, id: String, message: String },
    Encode { message: String },
    Io { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Unavailable { reason } => write!(f, "store unavailable: {reason}"),
            StoreError::Stream { collection, reason } => {
                write!(f, "watch stream on {collection} failed: {reason}")
            }
            StoreError::StreamClosed { collection } => {
                write!(f, "watch stream on {collection} closed")
            }
            StoreError::Transaction {
                collection,
                id,
                reason,
            } => write!(f, "transaction on {collection}/{id} failed: {reason}"),
            StoreError::Decode {
                collection,
                id,
                message,
            } => write!(f, "decode {collection}/{id} failed: {message}"),
            StoreError::Encode { message } => write!(f, "encode document failed: {message}"),
            StoreError::Io { reason } => write!(f, "store io error: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(error: std::io::Error) -> Self {
        StoreError::Io {
            reason: error.to_string(),
        }
    }
}

pub fn encode_fields<T: Serialize>(value: &T) -> Result<DocumentFields, StoreError> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::Object(fields)) => Ok(fields),
        Ok(other) => Err(StoreError::Encode {
            message: format!("document root must be an object, got {other}"),
        }),
        Err(err) => Err(StoreError::Encode {
            message: err.to_string(),
        }),
    }
}

pub fn decode_fields<T: DeserializeOwned>(fields: &DocumentFields) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::Object(fields.clone())).map_err(|err| err.to_string())
}
