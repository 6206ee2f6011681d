//! Event loop driving the ingestion pipeline.
//!
//! All inputs of the pipeline arrive on a single channel, the pipeline itself is only touched by
//! the thread running the loop. Instead of polling, the loop blocks until the next event or the
//! next deadline of the pipeline, whichever comes first.
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::alert::AlertChannel;
use crate::error::SinkError;
use crate::pipeline::{IngestionPipeline, PersistDispatcher};
use crate::record::{PersistedRecord, RecordId};

/// Maximum time to wait for an in-flight write on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum Event {
    /// A payload received on the readings topic.
    Message { payload: Vec<u8>, received_at: DateTime<Utc> },
    /// Result of the write issued by the database thread.
    PersistCompleted(Result<RecordId, SinkError>),
    /// Stop accepting messages and finish the in-flight write.
    Shutdown,
}

/// Dispatcher handing records to the database thread.
pub struct ChannelDispatcher
{
    requests: Sender<PersistedRecord>,
}

impl ChannelDispatcher {
    pub fn new(requests: Sender<PersistedRecord>) -> ChannelDispatcher {
        ChannelDispatcher { requests }
    }
}

impl PersistDispatcher for ChannelDispatcher {
    fn dispatch(&mut self, record: PersistedRecord) -> Result<(), SinkError> {
        self.requests
            .send(record)
            .map_err(|_| SinkError::Unavailable(String::from("database thread is not running")))
    }
}

/// Runs the pipeline until a shutdown is requested or every event sender is gone.
///
/// A write still in flight at that point is waited for, at most for `SHUTDOWN_GRACE`.
pub fn run_pipeline<D: PersistDispatcher, A: AlertChannel>(pipeline: &mut IngestionPipeline<D, A>, events: &Receiver<Event>)
{
    log::info!(target: "sensord", "Pipeline started!");

    loop {
        let event = match pipeline.next_deadline() {
            Some(deadline) => {
                let wait = (deadline - Utc::now()).to_std().unwrap_or_else(|_| Duration::from_secs(0));
                match events.recv_timeout(wait) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => {
                        pipeline.on_tick(Utc::now());
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match events.recv() {
                Ok(event) => event,
                Err(_) => break,
            },
        };

        match event {
            Event::Message { payload, received_at } => pipeline.on_payload(&payload, received_at),
            Event::PersistCompleted(result) => pipeline.on_persist_completed(result, Utc::now()),
            Event::Shutdown => {
                log::info!(target: "sensord", "Shutdown requested!");
                break;
            }
        }
    }

    finish_in_flight(pipeline, events);
    log::info!(target: "sensord", "Pipeline stopped!");
}

fn finish_in_flight<D: PersistDispatcher, A: AlertChannel>(pipeline: &mut IngestionPipeline<D, A>, events: &Receiver<Event>)
{
    let give_up_at = Instant::now() + SHUTDOWN_GRACE;

    while pipeline.is_persisting() {
        let wait = give_up_at.saturating_duration_since(Instant::now());
        match events.recv_timeout(wait) {
            Ok(Event::PersistCompleted(result)) => pipeline.on_persist_completed(result, Utc::now()),
            Ok(_) => log::debug!(target: "sensord", "Discarding event received during shutdown"),
            Err(_) => {
                log::warn!(target: "sensord", "Gave up waiting for the in-flight write!");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::testing::RecordingAlertChannel;
    use crate::config::PipelineParameters;
    use crate::pipeline::testing::RecordingDispatcher;
    use serde_json::json;
    use std::sync::mpsc;
    use std::thread;

    fn valid_message() -> Event {
        let body = json!({
            "temperature": 22,
            "Light": 100,
            "Soil humidity": 40,
            "humidity": 50,
            "Pressure": 1000
        });
        Event::Message {
            payload: body.to_string().into_bytes(),
            received_at: Utc::now(),
        }
    }

    fn pipeline(params: &PipelineParameters) -> (IngestionPipeline<RecordingDispatcher, RecordingAlertChannel>, RecordingDispatcher) {
        let dispatcher = RecordingDispatcher::default();
        let pipeline = IngestionPipeline::new(params, dispatcher.clone(), RecordingAlertChannel::default());
        (pipeline, dispatcher)
    }

    #[test]
    fn messages_within_window_are_written_once() {
        let (mut pipeline, dispatcher) = pipeline(&PipelineParameters::default());
        let (tx, rx) = mpsc::channel();
        tx.send(valid_message()).unwrap();
        tx.send(Event::PersistCompleted(Ok(1))).unwrap();
        tx.send(valid_message()).unwrap();
        tx.send(valid_message()).unwrap();
        tx.send(Event::Shutdown).unwrap();

        run_pipeline(&mut pipeline, &rx);

        assert_eq!(dispatcher.records.borrow().len(), 1);
        assert_eq!(pipeline.stats().received, 3);
        assert_eq!(pipeline.stats().persisted, 1);
    }

    #[test]
    fn shutdown_waits_for_in_flight_write() {
        let (mut pipeline, dispatcher) = pipeline(&PipelineParameters::default());
        let (tx, rx) = mpsc::channel();
        tx.send(valid_message()).unwrap();
        tx.send(Event::Shutdown).unwrap();
        tx.send(valid_message()).unwrap();
        tx.send(Event::PersistCompleted(Ok(1))).unwrap();

        run_pipeline(&mut pipeline, &rx);

        assert!(!pipeline.is_persisting());
        assert_eq!(pipeline.stats().received, 1);
        assert_eq!(pipeline.stats().persisted, 1);
        assert_eq!(dispatcher.records.borrow().len(), 1);
    }

    #[test]
    fn stops_when_all_senders_are_gone() {
        let (mut pipeline, _) = pipeline(&PipelineParameters::default());
        let (tx, rx) = mpsc::channel();
        tx.send(valid_message()).unwrap();
        tx.send(Event::PersistCompleted(Ok(1))).unwrap();
        drop(tx);

        run_pipeline(&mut pipeline, &rx);
        assert_eq!(pipeline.stats().persisted, 1);
    }

    #[test]
    fn failed_write_is_retried_by_timer() {
        let mut params = PipelineParameters::default();
        params.tick_ms = 10;
        let (mut pipeline, dispatcher) = pipeline(&params);
        *dispatcher.unavailable.borrow_mut() = true;

        let (tx, rx) = mpsc::channel();
        tx.send(valid_message()).unwrap();
        let shutdown_tx = tx.clone();
        let shutdown = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            shutdown_tx.send(Event::Shutdown).unwrap();
        });

        run_pipeline(&mut pipeline, &rx);
        shutdown.join().unwrap();

        assert!(pipeline.stats().sink_failures >= 2);
        assert_eq!(pipeline.stats().received, 1);
    }

    #[test]
    fn channel_dispatcher_reports_stopped_database_thread() {
        let (tx, rx) = mpsc::channel();
        let mut dispatcher = ChannelDispatcher::new(tx);
        let record = PersistedRecord {
            data: serde_json::Map::new(),
            received_at: Utc::now(),
        };
        assert!(dispatcher.dispatch(record.clone()).is_ok());
        assert_eq!(rx.recv().unwrap(), record);

        drop(rx);
        assert!(matches!(dispatcher.dispatch(record), Err(SinkError::Unavailable(_))));
    }
}
