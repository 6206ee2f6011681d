use std::sync::mpsc::{Sender, Receiver};
use std::sync::{mpsc, Arc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use std::process::exit;

use clap::App;

mod alert;
mod classifier;
mod config;
mod database;
mod error;
mod mqtt;
mod pipeline;
mod record;
mod runtime;
mod throttle;
mod validator;

use crate::alert::LogAlertChannel;
use crate::config::Configuration;
use crate::pipeline::IngestionPipeline;
use crate::record::PersistedRecord;
use crate::runtime::{ChannelDispatcher, Event};

fn main() {
    let cli_yaml = clap::load_yaml!("cli.yml");
    let matches = App::from(cli_yaml).get_matches();
    let config_path = matches.value_of("config").unwrap_or("/etc/sensord/sensord.yml");
    let log_config_path = matches.value_of("log-config").unwrap_or("/etc/sensord/log.yml");

    match log4rs::init_file(log_config_path, Default::default()) {
        Ok(_) => {},
        Err(err) => {
            eprintln!("Could not create logger from yaml configuration \'{}\': {}", log_config_path, err);
            exit(100);
        }
    };

    let configuration = match Configuration::load(config_path) {
        Ok(configuration) => configuration,
        Err(err) => {
            log::error!(target: "sensord", "Cannot load the configuration: \'{}\'", err);
            exit(101);
        }
    };
    log::info!(target: "sensord", "Loaded configuration from \'{}\'", config_path);

    let (event_tx, event_rx): (Sender<Event>, Receiver<Event>) = mpsc::channel();
    let (request_tx, request_rx): (Sender<PersistedRecord>, Receiver<PersistedRecord>) = mpsc::channel();

    let terminate_programm = Arc::new(AtomicBool::new(false));
    let terminate_signal = Arc::clone(&terminate_programm);
    let terminate_mqtt_thread = Arc::clone(&terminate_programm);
    let terminate_database_thread = Arc::clone(&terminate_programm);

    let signal_tx = event_tx.clone();
    match ctrlc::set_handler(move || {
        log::info!(target: "sensord", "Termination signal received!");
        terminate_signal.store(true, Ordering::SeqCst);
        let _ = signal_tx.send(Event::Shutdown);
    }) {
        Ok(_) => {},
        Err(err) => {
            log::error!(target: "sensord", "Error setting the termination handler: \'{}\'", err);
            exit(200);
        }
    };

    let mut pipeline = IngestionPipeline::new(&configuration.pipeline,
                                              ChannelDispatcher::new(request_tx),
                                              LogAlertChannel::default());

    let database_configuration = configuration.database.clone();
    let database_events = event_tx.clone();
    let database_thread = match thread::Builder::new()
        .name("database".to_string())
        .spawn(move || {
            database::database_thread(request_rx, database_events, terminate_database_thread, database_configuration);
        }) {
        Ok(database_handle) => database_handle,
        Err(err) => {
            log::error!(target: "sensord", "Cannot start the database thread: \'{}\'", err);
            exit(201);
        }
    };

    let mqtt_configuration = configuration.mqtt.clone();
    let mqtt_thread = match thread::Builder::new()
        .name("mqtt".to_string())
        .spawn(move || {
            mqtt::thread_mqtt(event_tx, terminate_mqtt_thread, mqtt_configuration);
        }) {
        Ok(mqtt_handle) => mqtt_handle,
        Err(err) => {
            log::error!(target: "sensord", "Cannot start the mqtt thread: \'{}\'", err);
            // Closes the request channel so the database thread returns.
            drop(pipeline);
            let _ = database_thread.join();
            exit(202);
        }
    };

    runtime::run_pipeline(&mut pipeline, &event_rx);

    let stats = pipeline.stats();
    match pipeline.throttle().last_persist_at() {
        Some(at) => log::info!(target: "sensord", "Last reading stored at {}", at),
        None => log::info!(target: "sensord", "No reading stored during this run"),
    };
    drop(pipeline);
    terminate_programm.store(true, Ordering::SeqCst);

    match mqtt_thread.join() {
        Ok(_) => log::debug!(target: "sensord", "Joined mqtt thread!"),
        Err(_) => {
            log::error!(target: "sensord", "Could not join the mqtt thread!");
            exit(301);
        }
    };
    match database_thread.join() {
        Ok(_) => log::debug!(target: "sensord", "Joined database thread!"),
        Err(_) => {
            log::error!(target: "sensord", "Could not join the database thread!");
            exit(302);
        }
    };

    log::info!(target: "sensord",
               "Exiting. received: {}, stored: {}, rejected: {}, undecodable: {}, failed writes: {}, dropped in flight: {}, alerts: {}",
               stats.received, stats.persisted, stats.rejected, stats.decode_failures, stats.sink_failures,
               stats.dropped_in_flight, stats.alerts);
    exit(0);
}
