//! Schema validation of decoded records against the configured required fields.
use serde_json::Value;

use crate::error::ValidationError;
use crate::record::{RawRecord, ValidatedRecord};

/// Fields every reading of the default sensor setup has to contain.
pub const DEFAULT_REQUIRED_FIELDS: [&str; 5] = ["temperature", "Light", "Soil humidity", "humidity", "Pressure"];

#[derive(Debug, Clone)]
/// Checks records for a fixed list of required fields.
pub struct SchemaValidator
{
    required_fields: Vec<String>,
}

impl Default for SchemaValidator {
    fn default() -> Self {
        SchemaValidator::new(DEFAULT_REQUIRED_FIELDS.iter().map(|field| field.to_string()).collect())
    }
}

impl SchemaValidator {
    pub fn new(required_fields: Vec<String>) -> SchemaValidator {
        SchemaValidator { required_fields }
    }

    /// Validates a record against the required fields.
    ///
    /// Fields are checked in the configured order and the first failing field is reported.
    ///
    /// # Errors
    ///
    /// * `ValidationError::NotAnObject` - The record is not a JSON object.
    ///
    /// * `ValidationError::MissingField` - A required field is absent or null.
    ///
    pub fn validate(&self, record: RawRecord) -> Result<ValidatedRecord, ValidationError> {
        let fields = match record.value {
            Value::Object(fields) => fields,
            _ => return Err(ValidationError::NotAnObject),
        };

        for field in &self.required_fields {
            match fields.get(field) {
                None | Some(Value::Null) => return Err(ValidationError::MissingField(field.clone())),
                Some(_) => {}
            }
        }

        Ok(ValidatedRecord::new(fields, record.received_at))
    }
}
