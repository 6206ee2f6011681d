//! Temperature threshold rules applied to validated readings.
use serde::{Deserialize, Serialize};

use crate::record::ValidatedRecord;

const TEMPERATURE_FIELD: &str = "temperature";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
/// Temperature limits in celsius.
pub struct Thresholds
{
    /// Readings above this temperature are rejected.
    pub max_temperature: f64,
    /// Readings above this temperature are stored and raise an alert.
    pub alert_temperature: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            max_temperature: 50.0,
            alert_temperature: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Accept,
    AcceptWithAlert { reason: &'static str, temperature: f64 },
    Reject { reason: &'static str },
}

#[derive(Debug, Clone, Default)]
pub struct ThresholdClassifier
{
    thresholds: Thresholds,
}

impl ThresholdClassifier {
    pub fn new(thresholds: Thresholds) -> ThresholdClassifier {
        ThresholdClassifier { thresholds }
    }

    pub fn classify(&self, record: &ValidatedRecord) -> Decision {
        let temperature = match record.get(TEMPERATURE_FIELD).and_then(|value| value.as_f64()) {
            Some(temperature) => temperature,
            None => return Decision::Reject { reason: "temperature-not-numeric" },
        };

        if temperature > self.thresholds.max_temperature {
            Decision::Reject { reason: "temperature-out-of-range" }
        } else if temperature > self.thresholds.alert_temperature {
            Decision::AcceptWithAlert { reason: "high-temperature", temperature }
        } else {
            Decision::Accept
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Map, Value};

    fn reading(temperature: Value) -> ValidatedRecord {
        let mut fields = Map::new();
        fields.insert(TEMPERATURE_FIELD.to_string(), temperature);
        ValidatedRecord::new(fields, Utc.timestamp_millis_opt(0).unwrap())
    }

    #[test]
    fn boundaries_of_default_thresholds() {
        let classifier = ThresholdClassifier::default();
        assert_eq!(classifier.classify(&reading(json!(20))), Decision::Accept);
        assert_eq!(classifier.classify(&reading(json!(30))), Decision::Accept);
        assert_eq!(
            classifier.classify(&reading(json!(30.5))),
            Decision::AcceptWithAlert { reason: "high-temperature", temperature: 30.5 }
        );
        assert_eq!(
            classifier.classify(&reading(json!(50))),
            Decision::AcceptWithAlert { reason: "high-temperature", temperature: 50.0 }
        );
        assert_eq!(
            classifier.classify(&reading(json!(50.1))),
            Decision::Reject { reason: "temperature-out-of-range" }
        );
    }

    #[test]
    fn negative_temperatures_are_accepted() {
        assert_eq!(ThresholdClassifier::default().classify(&reading(json!(-12.5))), Decision::Accept);
    }

    #[test]
    fn non_numeric_temperature_is_rejected() {
        let decision = ThresholdClassifier::default().classify(&reading(json!("hot")));
        assert_eq!(decision, Decision::Reject { reason: "temperature-not-numeric" });
    }

    #[test]
    fn custom_thresholds() {
        let classifier = ThresholdClassifier::new(Thresholds { max_temperature: 10.0, alert_temperature: 5.0 });
        assert_eq!(
            classifier.classify(&reading(json!(7))),
            Decision::AcceptWithAlert { reason: "high-temperature", temperature: 7.0 }
        );
        assert_eq!(
            classifier.classify(&reading(json!(11))),
            Decision::Reject { reason: "temperature-out-of-range" }
        );
        assert_eq!(classifier.classify(&reading(json!(5))), Decision::Accept);
    }
}
