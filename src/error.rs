use std::{fmt, io, sync::mpsc::SendError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast::error::SendError as BroadcastSendError, mpsc::error::SendError as TokioSendError};

#[cfg(feature = "service")]
use sqlx::{migrate::MigrateError, Error as SqlxError};

use serde_json::Error as JsonError;

use crate::{event::Event, properties::EntityId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum ArborError {
    #[error("Cache backend error: {0}")]
    Cache(String),
    #[error("Configuration error: {0}")]
    Config(String),
    /// Offending chain runs from the candidate parent up to the node being moved.
    #[error("Cycle detected: moving would place a node beneath itself (chain {chain:?})")]
    CycleDetected { chain: Vec<EntityId> },
    #[error("Event publication error: {0}")]
    Event(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Malformed tree: {0}")]
    MalformedTree(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Operation cancelled")]
    OperationCancelled,
    #[error("Persistence failure: {0}")]
    PersistenceFailure(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for ArborError {
    fn from(src: toml::de::Error) -> ArborError {
        ArborError::Config(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for ArborError {
    fn from(src: toml::ser::Error) -> ArborError {
        ArborError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<JsonError> for ArborError {
    fn from(src: JsonError) -> ArborError {
        ArborError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<io::Error> for ArborError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => ArborError::NotFound(format!("{x}")),
            _ => ArborError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<fmt::Error> for ArborError {
    fn from(x: fmt::Error) -> Self {
        ArborError::Serialization(format!("{x}"))
    }
}

impl From<SendError<Event>> for ArborError {
    fn from(x: SendError<Event>) -> Self {
        ArborError::Event(format!(
            "Channel send error, could not transmit change event {:?}",
            x.0
        ))
    }
}

impl From<TokioSendError<Event>> for ArborError {
    fn from(x: TokioSendError<Event>) -> Self {
        ArborError::Event(format!(
            "Channel send error, could not transmit change event {:?}",
            x.0
        ))
    }
}

impl From<BroadcastSendError<Event>> for ArborError {
    fn from(x: BroadcastSendError<Event>) -> Self {
        ArborError::Event(format!(
            "No broadcast subscribers for change event {:?}",
            x.0
        ))
    }
}

#[cfg(feature = "service")]
impl From<SqlxError> for ArborError {
    fn from(db_error: SqlxError) -> Self {
        ArborError::PersistenceFailure(format!("database error: {db_error:?}"))
    }
}

#[cfg(feature = "service")]
impl From<MigrateError> for ArborError {
    fn from(migrate_error: MigrateError) -> Self {
        ArborError::PersistenceFailure(format!("migration error: {migrate_error}"))
    }
}
