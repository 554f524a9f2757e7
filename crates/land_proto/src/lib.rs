pub mod oracle_wire;
pub mod position;
pub mod store;

pub use oracle_wire::{
    Prediction, PredictionInstance, PredictionRequest, PredictionResponse, SenseState,
    SENSE_COLS, SENSE_PLANES, SENSE_ROWS,
};
pub use position::{FieldTile, PlayerRecord, Position, UserActivity};
pub use store::{
    decode_fields, encode_fields, ChangeBatch, ChangeKind, ChangeStream, Document, DocumentChange,
    DocumentFields, DocumentStore, StoreError,
};
