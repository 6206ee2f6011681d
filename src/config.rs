//! Daemon configuration read once at startup from a yaml file.
use std::fs::File;
use std::io::Read;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::classifier::Thresholds;
use crate::database::DatabaseParameters;
use crate::error::ConfigError;
use crate::mqtt::MqttParams;
use crate::validator::DEFAULT_REQUIRED_FIELDS;

/// Upper bound of `window_ms` and `tick_ms`, one year.
pub const MAX_INTERVAL_MS: u64 = 365 * 24 * 60 * 60 * 1_000;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Configuration {
    /// Parameters of the broker connection the readings are received from.
    pub mqtt: MqttParams,
    /// Parameters of the database the readings are stored in.
    pub database: DatabaseParameters,
    /// Validation and throttling options.
    #[serde(default)]
    pub pipeline: PipelineParameters,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
/// Options of the ingestion pipeline.
pub struct PipelineParameters {
    /// Fields every reading has to contain with a non-null value.
    pub required_fields: Vec<String>,
    /// Minimum interval between two stored readings in milliseconds.
    pub window_ms: u64,
    /// Delay before a failed persist is retried in milliseconds.
    pub tick_ms: u64,
    /// Readings above this temperature are rejected.
    pub max_temperature: f64,
    /// Readings above this temperature raise an alert.
    pub alert_temperature: f64,
}

impl Default for PipelineParameters {
    fn default() -> Self {
        let thresholds = Thresholds::default();
        PipelineParameters {
            required_fields: DEFAULT_REQUIRED_FIELDS.iter().map(|field| field.to_string()).collect(),
            window_ms: 60_000,
            tick_ms: 1_000,
            max_temperature: thresholds.max_temperature,
            alert_temperature: thresholds.alert_temperature,
        }
    }
}

impl PipelineParameters {
    pub fn window(&self) -> Duration {
        Duration::milliseconds(self.window_ms as i64)
    }

    pub fn tick(&self) -> Duration {
        Duration::milliseconds(self.tick_ms as i64)
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            max_temperature: self.max_temperature,
            alert_temperature: self.alert_temperature,
        }
    }
}

impl Configuration {
    /// Reads, deserializes and validates the configuration file at `path`.
    pub fn load(path: &str) -> Result<Configuration, ConfigError> {
        let mut configuration_file = File::open(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;

        let mut configuration_string = String::new();
        configuration_file
            .read_to_string(&mut configuration_string)
            .map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;

        Configuration::from_yaml(configuration_string.as_str())
    }

    pub fn from_yaml(yaml: &str) -> Result<Configuration, ConfigError> {
        let configuration = serde_yaml::from_str::<Configuration>(yaml)?;
        configuration.validate()?;
        Ok(configuration)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pipeline = &self.pipeline;
        if pipeline.window_ms == 0 {
            return Err(ConfigError::Invalid(String::from("pipeline.window_ms must be greater than zero")));
        }
        if pipeline.tick_ms == 0 {
            return Err(ConfigError::Invalid(String::from("pipeline.tick_ms must be greater than zero")));
        }
        for (name, value) in &[("window_ms", pipeline.window_ms), ("tick_ms", pipeline.tick_ms)] {
            if *value > MAX_INTERVAL_MS {
                return Err(ConfigError::Invalid(format!(
                    "pipeline.{} ({}) exceeds the maximum of {} ms",
                    name, value, MAX_INTERVAL_MS
                )));
            }
        }
        if pipeline.required_fields.is_empty() {
            return Err(ConfigError::Invalid(String::from("pipeline.required_fields must not be empty")));
        }
        if pipeline.alert_temperature > pipeline.max_temperature {
            return Err(ConfigError::Invalid(format!(
                "pipeline.alert_temperature ({}) is above pipeline.max_temperature ({})",
                pipeline.alert_temperature, pipeline.max_temperature
            )));
        }
        if self.mqtt.topic.is_empty() {
            return Err(ConfigError::Invalid(String::from("mqtt.topic must not be empty")));
        }
        if self.mqtt.tls_enable && self.mqtt.tls_params.is_none() {
            return Err(ConfigError::Invalid(String::from("mqtt.tls_enable is set but no mqtt.tls_params are given")));
        }
        if self.database.tls_enable && self.database.tls_params.is_none() {
            return Err(ConfigError::Invalid(String::from(
                "database.tls_enable is set but no database.tls_params are given",
            )));
        }
        let table_name_valid = !self.database.table.is_empty()
            && self.database.table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !self.database.table.starts_with(|c: char| c.is_ascii_digit());
        if !table_name_valid {
            return Err(ConfigError::Invalid(format!(
                "database.table '{}' is not a plain sql identifier",
                self.database.table
            )));
        }
        Ok(())
    }
}
