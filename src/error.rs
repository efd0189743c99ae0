//! Error types for the routing engine.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Integration error: {0}")]
    Integration(#[from] IntegrationError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Transport (outbound send) errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Send failed on channel {channel_id}: {reason}")]
    SendFailed { channel_id: Uuid, reason: String },

    #[error("Channel {channel_id} is not connected")]
    Disconnected { channel_id: Uuid },

    #[error("Invalid recipient address: {0}")]
    InvalidRecipient(String),
}

/// External bot/flow engine errors.
#[derive(Debug, thiserror::Error)]
pub enum IntegrationError {
    #[error("{kind} call failed: {reason}")]
    CallFailed { kind: &'static str, reason: String },

    #[error("{kind} call timed out after {timeout:?}")]
    Timeout { kind: &'static str, timeout: Duration },

    #[error("Integration {id} has no usable configuration: {reason}")]
    BadConfig { id: Uuid, reason: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
