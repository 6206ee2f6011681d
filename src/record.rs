//! Module that contains the record types passed through the ingestion pipeline.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;

/// Identifier assigned by the sink to a stored record.
pub type RecordId = i64;

#[derive(Debug, Clone, PartialEq)]
/// A message body decoded from the mqtt payload.
///
/// No shape is assumed before validation, the decoded value may be anything JSON allows.
pub struct RawRecord
{
    /// The decoded JSON value of the message body.
    pub value: Value,
    /// Local timestamp the message was received at.
    pub received_at: DateTime<Utc>,
}

impl RawRecord {
    pub fn new(value: Value, received_at: DateTime<Utc>) -> RawRecord {
        RawRecord { value, received_at }
    }

    /// Decodes a raw payload as UTF-8 JSON text.
    ///
    /// Trailing whitespace (newlines sent by most sensor firmwares) is ignored.
    ///
    /// # Errors
    ///
    /// * `DecodeError::Utf8` - The payload is not valid UTF-8.
    ///
    /// * `DecodeError::Json` - The payload is not valid JSON.
    ///
    pub fn decode(payload: &[u8], received_at: DateTime<Utc>) -> Result<RawRecord, DecodeError> {
        let payload_str = std::str::from_utf8(payload)?;
        let value = serde_json::from_str::<Value>(payload_str.trim_end())?;
        Ok(RawRecord::new(value, received_at))
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A record known to contain every required field with a non-null value.
///
/// Only the validator constructs these, the fields are not exposed mutably.
pub struct ValidatedRecord
{
    fields: Map<String, Value>,
    received_at: DateTime<Utc>,
}

impl ValidatedRecord {
    pub(crate) fn new(fields: Map<String, Value>, received_at: DateTime<Utc>) -> ValidatedRecord {
        ValidatedRecord { fields, received_at }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
/// Struct representing a validated sensor reading as it is handed to the sink.
///
/// The write timestamp is assigned by the sink itself.
pub struct PersistedRecord
{
    /// The sensor values of the reading.
    pub data: Map<String, Value>,
    /// Timestamp the reading was received by this daemon.
    pub received_at: DateTime<Utc>,
}

impl From<ValidatedRecord> for PersistedRecord {
    fn from(record: ValidatedRecord) -> Self {
        PersistedRecord {
            data: record.fields,
            received_at: record.received_at,
        }
    }
}
