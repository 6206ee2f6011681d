//! Error types of the ingestion pipeline and its collaborators.
use thiserror::Error;

#[derive(Debug, Error)]
/// A message payload that could not be decoded into a record.
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Error)]
/// A decoded record that does not match the required schema.
pub enum ValidationError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("required field '{0}' is missing or null")]
    MissingField(String),
}

#[derive(Debug, Error)]
/// A failed write to the sink.
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] postgres::Error),
    #[error("tls setup failed: {0}")]
    Tls(#[from] openssl::error::ErrorStack),
    #[error("sink is misconfigured: {0}")]
    Misconfigured(String),
    #[error("sink is unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
/// A configuration that cannot be used to start the daemon.
pub enum ConfigError {
    #[error("cannot read the configuration file '{path}': {source}")]
    Read { path: String, source: std::io::Error },
    #[error("cannot deserialize the configuration: {0}")]
    Deserialize(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
