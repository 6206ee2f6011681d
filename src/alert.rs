//! Alerts raised for readings that are stored but need operator attention.
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Severity {
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Alert
{
    pub severity: Severity,
    pub message: String,
}

impl Alert {
    pub fn warning<S: Into<String>>(message: S) -> Alert {
        Alert {
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

/// Receiver of alerts.
///
/// Delivery is fire-and-forget, an implementation must never block or fail the caller.
pub trait AlertChannel {
    fn raise(&self, alert: Alert);
}

#[derive(Debug, Default)]
/// Alert channel writing to the `sensord::alert` logger.
///
/// The logging configuration decides where alerts end up.
pub struct LogAlertChannel;

impl AlertChannel for LogAlertChannel {
    fn raise(&self, alert: Alert) {
        match alert.severity {
            Severity::Warning => log::warn!(target: "sensord::alert", "[{}] {}", alert.severity, alert.message),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Default, Clone)]
    /// Alert channel keeping every alert for inspection.
    pub struct RecordingAlertChannel
    {
        pub alerts: Rc<RefCell<Vec<Alert>>>,
    }

    impl AlertChannel for RecordingAlertChannel {
        fn raise(&self, alert: Alert) {
            self.alerts.borrow_mut().push(alert);
        }
    }
}
