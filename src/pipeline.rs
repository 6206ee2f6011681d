//! Orchestration of decoding, throttling, validation, classification and persisting of readings.
//!
//! The pipeline is driven by three kinds of events: a received payload, a timer deadline and the
//! completion of a sink write. Sink writes run outside of the pipeline, at most one is in flight
//! at any time. Time is always passed in by the caller.
use chrono::{DateTime, Duration, Utc};

use crate::alert::{Alert, AlertChannel};
use crate::classifier::{Decision, ThresholdClassifier};
use crate::config::PipelineParameters;
use crate::error::SinkError;
use crate::record::{PersistedRecord, RawRecord, RecordId};
use crate::throttle::{ThrottleWindow, WindowSignal};
use crate::validator::SchemaValidator;

/// Hands records over to the sink.
///
/// The outcome of the write is reported back through `IngestionPipeline::on_persist_completed`.
pub trait PersistDispatcher {
    /// Issues the write of `record`.
    ///
    /// # Errors
    ///
    /// * `SinkError` - If the write could not even be issued, no completion will follow.
    ///
    fn dispatch(&mut self, record: PersistedRecord) -> Result<(), SinkError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineState {
    Idle,
    /// A sink write is in flight. The alert is raised once the write succeeded.
    Persisting { alert: Option<Alert> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PipelineStats {
    pub received: u64,
    pub decode_failures: u64,
    pub rejected: u64,
    pub persisted: u64,
    pub sink_failures: u64,
    pub dropped_in_flight: u64,
    pub alerts: u64,
}

pub struct IngestionPipeline<D: PersistDispatcher, A: AlertChannel>
{
    validator: SchemaValidator,
    classifier: ThresholdClassifier,
    throttle: ThrottleWindow,
    retry_interval: Duration,
    dispatcher: D,
    alerts: A,
    state: PipelineState,
    last_attempt_at: Option<DateTime<Utc>>,
    stats: PipelineStats,
}

impl<D: PersistDispatcher, A: AlertChannel> IngestionPipeline<D, A> {
    pub fn new(params: &PipelineParameters, dispatcher: D, alerts: A) -> IngestionPipeline<D, A> {
        IngestionPipeline {
            validator: SchemaValidator::new(params.required_fields.clone()),
            classifier: ThresholdClassifier::new(params.thresholds()),
            throttle: ThrottleWindow::new(params.window()),
            retry_interval: params.tick(),
            dispatcher,
            alerts,
            state: PipelineState::Idle,
            last_attempt_at: None,
            stats: PipelineStats::default(),
        }
    }

    pub fn is_persisting(&self) -> bool {
        self.state != PipelineState::Idle
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn throttle(&self) -> &ThrottleWindow {
        &self.throttle
    }

    /// Handles a payload received at `now`.
    pub fn on_payload(&mut self, payload: &[u8], now: DateTime<Utc>) {
        self.stats.received += 1;
        let record = match RawRecord::decode(payload, now) {
            Ok(record) => record,
            Err(err) => {
                self.stats.decode_failures += 1;
                log::warn!(target: "sensord::pipeline", "Discarding message: \'{}\'", err);
                return;
            }
        };
        log::debug!(target: "sensord::pipeline", "Received record: {}", record.value);

        let signal = self.throttle.on_message(record, now);
        self.handle_signal(signal, now);
    }

    /// Handles an elapsed timer deadline.
    pub fn on_tick(&mut self, now: DateTime<Utc>) {
        let signal = self.throttle.on_tick(now);
        self.handle_signal(signal, now);
    }

    /// Handles the outcome of the write issued by the last dispatch.
    pub fn on_persist_completed(&mut self, result: Result<RecordId, SinkError>, now: DateTime<Utc>) {
        let alert = match std::mem::replace(&mut self.state, PipelineState::Idle) {
            PipelineState::Persisting { alert } => alert,
            PipelineState::Idle => {
                log::warn!(target: "sensord::pipeline", "Ignoring persist completion without a write in flight!");
                return;
            }
        };

        match result {
            Ok(record_id) => {
                self.throttle.on_persist_succeeded(now);
                self.last_attempt_at = None;
                self.stats.persisted += 1;
                log::info!(target: "sensord::pipeline", "Record stored with id \'{}\'", record_id);
                if let Some(alert) = alert {
                    self.stats.alerts += 1;
                    self.alerts.raise(alert);
                }
            }
            Err(err) => {
                self.stats.sink_failures += 1;
                log::error!(target: "sensord::pipeline", "Storing record failed, retrying on next trigger: \'{}\'", err);
            }
        }
    }

    /// Instant at which `on_tick` has to be called next, `None` if no tick is needed.
    ///
    /// After an aborted or failed attempt the deadline is pushed back by at least the tick
    /// interval, a due record is then retried once per tick.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        if self.is_persisting() {
            return None;
        }
        let deadline = self.throttle.next_deadline()?;
        match self.last_attempt_at {
            Some(last_attempt_at) => Some(std::cmp::max(deadline, last_attempt_at + self.retry_interval)),
            None => Some(deadline),
        }
    }

    fn handle_signal(&mut self, signal: WindowSignal, now: DateTime<Utc>) {
        let record = match signal.record {
            Some(record) if signal.should_persist => record,
            _ => {
                log::trace!(target: "sensord::pipeline", "Next persist possible in {} ms", signal.wait_remaining.num_milliseconds());
                return;
            }
        };

        if self.is_persisting() {
            self.stats.dropped_in_flight += 1;
            log::debug!(target: "sensord::pipeline", "Persist already in flight, dropping trigger!");
            return;
        }
        self.last_attempt_at = Some(now);

        let validated = match self.validator.validate(record) {
            Ok(validated) => validated,
            Err(err) => {
                self.reject(&err.to_string());
                return;
            }
        };

        let alert = match self.classifier.classify(&validated) {
            Decision::Accept => None,
            Decision::AcceptWithAlert { reason, temperature } => {
                log::debug!(target: "sensord::pipeline", "Record accepted with alert \'{}\'", reason);
                Some(Alert::warning(format!("HIGH TEMPERATURE ALERT: {}°C", temperature)))
            }
            Decision::Reject { reason } => {
                self.reject(reason);
                return;
            }
        };

        self.state = PipelineState::Persisting { alert };
        if let Err(err) = self.dispatcher.dispatch(PersistedRecord::from(validated)) {
            self.on_persist_completed(Err(err), now);
        }
    }

    fn reject(&mut self, reason: &str) {
        self.stats.rejected += 1;
        self.throttle.on_persist_rejected();
        log::warn!(target: "sensord::pipeline", "Record rejected: \'{}\'", reason);
    }
}
