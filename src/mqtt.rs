//! Module receiving sensor readings from a mqtt broker and forwarding them to the pipeline.
extern crate paho_mqtt as mqtt;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{RecvTimeoutError, Sender};
use std::thread::sleep;
use std::time;
use std::time::SystemTime;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::alert::{Alert, AlertChannel, LogAlertChannel};
use crate::runtime::Event;

fn default_client_id_prefix() -> String {
    String::from("sensord")
}

fn default_reconnect_interval_ms() -> u64 {
    5_000
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Parameters for the mqtt connection.
pub struct MqttParams
{
    /// The address of the broker.
    pub address: String,
    /// The port of the broker.
    pub port: u32,
    /// Enable tls encryption.
    pub tls_enable: bool,
    /// Optional TLS parameters for the mqtt connection.
    #[serde(default)]
    pub tls_params: Option<MqttTlsParams>,
    /// Topic the sensor readings are published on.
    pub topic: String,
    /// The QoS to use for the subscription.
    pub qos: i32,
    /// Prefix of the client id, the unix timestamp of the start is appended.
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// Fixed delay between two reconnect attempts.
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// TLS parametes required for MQTT with TLS.
pub struct MqttTlsParams {
    /// The path to the CA certificate for TLS encryption.
    pub ca_path: String,
    /// The path to the certificate to use for TLS encryption.
    pub cert_path: String,
    /// The path to the key to use for TLS encryption.
    pub key_path: String,
    /// The password for the ssl private key.
    pub key_pass: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
/// Lifecycle notifications of the broker connection.
pub enum SourceEvent {
    Connected,
    Reconnecting,
    Offline,
    Error(String),
}

/// Logs a lifecycle notification, connection losses and errors are raised as alerts as well.
pub fn report<A: AlertChannel>(event: &SourceEvent, alerts: &A) {
    match event {
        SourceEvent::Connected => log::info!(target: "sensord::mqtt", "Connected to mqtt broker!"),
        SourceEvent::Reconnecting => log::info!(target: "sensord::mqtt", "Attempting to reconnect to mqtt broker..."),
        SourceEvent::Offline => {
            log::warn!(target: "sensord::mqtt", "Mqtt client is offline!");
            alerts.raise(Alert::warning("Mqtt client is offline, waiting to reconnect"));
        }
        SourceEvent::Error(err) => {
            log::error!(target: "sensord::mqtt", "Mqtt error: \'{}\'", err);
            alerts.raise(Alert::warning(format!("Mqtt error: {}", err)));
        }
    }
}

fn server_uri(params: &MqttParams) -> String {
    match params.tls_enable {
        true => format!("ssl://{}:{}", params.address, params.port),
        false => format!("tcp://{}:{}", params.address, params.port),
    }
}

fn connect_options(params: &MqttParams) -> Result<mqtt::ConnectOptions, String> {
    if !params.tls_enable {
        return Ok(mqtt::ConnectOptionsBuilder::new()
            .connect_timeout(time::Duration::from_millis(4000))
            .finalize());
    }

    let tls_params = match &params.tls_params {
        Some(tls_params) => tls_params,
        None => return Err(String::from("TLS enabled but no TLS parameters specified!")),
    };

    let mut ssl_options_builder = mqtt::SslOptionsBuilder::new();
    ssl_options_builder
        .trust_store(tls_params.ca_path.as_ref())
        .key_store(tls_params.cert_path.as_ref())
        .private_key(tls_params.key_path.as_ref());
    if let Some(key_pass) = &tls_params.key_pass {
        ssl_options_builder.private_key_password(key_pass.as_ref());
    }

    Ok(mqtt::ConnectOptionsBuilder::new()
        .connect_timeout(time::Duration::from_millis(4000))
        .ssl_options(ssl_options_builder.finalize())
        .finalize())
}

fn stop(events: &Sender<Event>, thread_finish: &Arc<AtomicBool>) {
    thread_finish.store(true, Ordering::SeqCst);
    let _ = events.send(Event::Shutdown);
}

fn reconnect<A: AlertChannel>(mqtt_client: &mut mqtt::Client, params: &MqttParams, thread_finish: &Arc<AtomicBool>, alerts: &A) {
    let interval = time::Duration::from_millis(params.reconnect_interval_ms);
    while !thread_finish.load(Ordering::SeqCst) {
        report(&SourceEvent::Reconnecting, alerts);
        match mqtt_client.reconnect() {
            Ok(_) => match mqtt_client.subscribe(params.topic.as_ref(), params.qos) {
                Ok(_) => {
                    report(&SourceEvent::Connected, alerts);
                    return;
                }
                Err(err) => report(&SourceEvent::Error(format!("Unable to resubscribe: {}", err)), alerts),
            },
            Err(err) => report(&SourceEvent::Error(format!("Unable to reconnect: {}", err)), alerts),
        }
        sleep(interval);
    }
}

/// Thread function for the mqtt connection.
///
/// Connects to the broker, subscribes to the readings topic and forwards every message to the
/// pipeline until `thread_finish` is set. A lost connection is re-established at a fixed interval.
///
/// Failing to set up the initial connection shuts down the pipeline.
pub fn thread_mqtt(events: Sender<Event>, thread_finish: Arc<AtomicBool>, params: MqttParams)
{
    let alerts = LogAlertChannel::default();

    let current_unix_timestamp = match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(n) => n.as_secs(),
        Err(_) => {
            log::error!(target: "sensord::mqtt", "Invalid system time. Its before the UNIX_EPOCH");
            stop(&events, &thread_finish);
            return;
        }
    };

    let create_opts = mqtt::CreateOptionsBuilder::new()
        .server_uri(server_uri(&params))
        .client_id(format!("{}-{}", params.client_id_prefix, current_unix_timestamp))
        .finalize();

    let mut mqtt_client = match mqtt::Client::new(create_opts) {
        Ok(client) => client,
        Err(err) => {
            log::error!(target: "sensord::mqtt", "Could not create mqtt client: \'{}\'!", err);
            stop(&events, &thread_finish);
            return;
        }
    };
    mqtt_client.set_timeout(time::Duration::from_millis(4000));

    let connection_opts = match connect_options(&params) {
        Ok(connection_opts) => connection_opts,
        Err(err) => {
            log::error!(target: "sensord::mqtt", "{}", err);
            stop(&events, &thread_finish);
            return;
        }
    };

    log::info!(target: "sensord::mqtt", "Connecting to mqtt broker \'{}\'...", server_uri(&params));
    match mqtt_client.connect(connection_opts) {
        Ok(_) => report(&SourceEvent::Connected, &alerts),
        Err(err) => {
            report(&SourceEvent::Error(format!("Unable to connect: {}", err)), &alerts);
            stop(&events, &thread_finish);
            return;
        }
    };

    let receiver_queue = mqtt_client.start_consuming();

    match mqtt_client.subscribe(params.topic.as_ref(), params.qos) {
        Ok(_) => {
            log::info!(target: "sensord::mqtt", "Listening for messages on topic \'{}\' with qos {}", params.topic, params.qos);
        }
        Err(err) => {
            report(&SourceEvent::Error(format!("Unable to subscribe: {}", err)), &alerts);
            match mqtt_client.disconnect(Option::None) {
                Ok(_) => log::info!(target: "sensord::mqtt", "Disconnected from mqtt broker!"),
                Err(err) =>  log::error!(target: "sensord::mqtt", "Could not disconnect from mqtt broker: {}", err)
            }
            stop(&events, &thread_finish);
            return;
        }
    };

    let timeout = time::Duration::from_millis(100);

    while !thread_finish.load(Ordering::SeqCst) {
        let message_opt = match receiver_queue.recv_timeout(timeout) {
            Ok(message_opt) => message_opt,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                report(&SourceEvent::Error(String::from("Consumer queue closed")), &alerts);
                break;
            }
        };

        match message_opt {
            Some(message) => {
                if message.topic() != params.topic {
                    log::warn!(target: "sensord::mqtt", "Received message on unexpected topic \'{}\'!", message.topic());
                    continue;
                }
                let event = Event::Message {
                    payload: message.payload().to_vec(),
                    received_at: Utc::now(),
                };
                match events.send(event) {
                    Ok(_) => log::trace!(target: "sensord::mqtt", "Forwarded message to pipeline!"),
                    Err(err) => {
                        log::error!(target: "sensord::mqtt", "Could not forward message to pipeline: \'{}\'", err);
                        break;
                    }
                };
            },
            None => {
                report(&SourceEvent::Offline, &alerts);
                reconnect(&mut mqtt_client, &params, &thread_finish, &alerts);
            }
        }
    }

    match mqtt_client.disconnect(Option::None) {
        Ok(_) => log::info!(target: "sensord::mqtt", "Disconnected from mqtt broker!"),
        Err(err) =>  log::error!(target: "sensord::mqtt", "Could not disconnect from mqtt broker: {}", err)
    };

    // The loop was left without a termination request, the pipeline has no source anymore.
    if !thread_finish.load(Ordering::SeqCst) {
        stop(&events, &thread_finish);
    }
}
