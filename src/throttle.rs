//! Module deciding when the latest received record is due to be persisted.
//!
//! At most one record is persisted per window. The record chosen is whichever record is the
//! latest one at the moment a persist becomes due, not the first one received in the window.
use chrono::{DateTime, Duration, Utc};

use crate::record::RawRecord;

#[derive(Debug, Clone, PartialEq)]
/// Answer of the throttle window to a single trigger.
pub struct WindowSignal
{
    /// A persist attempt of `record` should be made now.
    pub should_persist: bool,
    /// The record to persist, only set if a persist is due.
    pub record: Option<RawRecord>,
    /// Time until the window elapses. Only used for diagnostics.
    pub wait_remaining: Duration,
}

impl WindowSignal {
    fn due(record: RawRecord) -> WindowSignal {
        WindowSignal {
            should_persist: true,
            record: Some(record),
            wait_remaining: Duration::zero(),
        }
    }

    fn idle(wait_remaining: Duration) -> WindowSignal {
        WindowSignal {
            should_persist: false,
            record: None,
            wait_remaining,
        }
    }
}

#[derive(Debug)]
pub struct ThrottleWindow
{
    window: Duration,
    latest: Option<RawRecord>,
    /// The latest record failed validation or classification and is not retried by the timer.
    latest_rejected: bool,
    /// `None` until the first successful persist.
    last_persist_at: Option<DateTime<Utc>>,
}

impl ThrottleWindow {
    pub fn new(window: Duration) -> ThrottleWindow {
        ThrottleWindow {
            window,
            latest: None,
            latest_rejected: false,
            last_persist_at: None,
        }
    }

    #[cfg(test)]
    pub fn latest(&self) -> Option<&RawRecord> {
        self.latest.as_ref()
    }

    pub fn last_persist_at(&self) -> Option<DateTime<Utc>> {
        self.last_persist_at
    }

    fn wait_remaining(&self, now: DateTime<Utc>) -> Duration {
        match self.last_persist_at {
            None => Duration::zero(),
            Some(last_persist_at) => {
                // A clock stepping backwards counts as no time elapsed.
                let elapsed = std::cmp::max(now - last_persist_at, Duration::zero());
                if elapsed >= self.window {
                    Duration::zero()
                } else {
                    self.window - elapsed
                }
            }
        }
    }

    /// Replaces the latest record and reports whether it is due for persisting.
    pub fn on_message(&mut self, record: RawRecord, now: DateTime<Utc>) -> WindowSignal {
        self.latest = Some(record);
        self.latest_rejected = false;

        let wait_remaining = self.wait_remaining(now);
        match &self.latest {
            Some(latest) if wait_remaining <= Duration::zero() => WindowSignal::due(latest.clone()),
            _ => WindowSignal::idle(wait_remaining),
        }
    }

    /// Reports whether the pending latest record is due for persisting.
    ///
    /// This flushes a pending record when no further message arrives to trigger a persist.
    pub fn on_tick(&self, now: DateTime<Utc>) -> WindowSignal {
        let wait_remaining = self.wait_remaining(now);
        match &self.latest {
            Some(latest) if !self.latest_rejected && wait_remaining <= Duration::zero() => WindowSignal::due(latest.clone()),
            _ => WindowSignal::idle(wait_remaining),
        }
    }

    /// Starts a new window. Must only be called once the sink confirmed the write.
    pub fn on_persist_succeeded(&mut self, at: DateTime<Utc>) {
        self.last_persist_at = Some(at);
    }

    /// Marks the latest record as rejected so the timer does not retry it.
    ///
    /// The window is left untouched, the next valid message is still eligible immediately.
    pub fn on_persist_rejected(&mut self) {
        self.latest_rejected = true;
    }

    /// Instant at which the pending latest record becomes due.
    ///
    /// Returns `None` if there is nothing the timer could persist.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        let latest = match &self.latest {
            Some(latest) if !self.latest_rejected => latest,
            _ => return None,
        };
        match self.last_persist_at {
            Some(last_persist_at) => Some(last_persist_at + self.window),
            None => Some(latest.received_at),
        }
    }
}
