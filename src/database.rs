//! Module for connecting to a postgres database and storing the readings handed over by the
//! ingestion pipeline in the database.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};

use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use postgres::Client;
use postgres_openssl::MakeTlsConnector;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SinkError;
use crate::record::{PersistedRecord, RecordId};
use crate::runtime::Event;

static SQL_CREATE_TABLE: &'static str = include_str!("sql/create_table.sql");
static SQL_INSERT_RECORD: &'static str = include_str!("sql/insert_record.sql");

/// Seconds to wait for the database server when (re)connecting.
const CONNECT_TIMEOUT_SECONDS: u32 = 10;

fn default_table() -> String {
    String::from("sensor_data")
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Struct modeling the parameters required for a database connection.
///
/// This includes SSL/TLS encryption.
pub struct DatabaseParameters
{
    /// The hostname of the database server.
    pub hostname: String,
    /// The port for the database server.
    pub port: u32,
    /// The username to connect as.
    pub username: String,
    /// The password to connect with.
    pub password: String,
    /// The database to open on the server.
    pub database: String,
    /// The table the readings are stored in. Created if it does not exist.
    #[serde(default = "default_table")]
    pub table: String,
    /// Flag to enable tls for the database server connection.
    pub tls_enable: bool,
    /// Parameters for the tls connection to the database server.
    #[serde(default)]
    pub tls_params: Option<DatabaseTlsParameters>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Struct for the parameters required for a tls connection to the database.
pub struct DatabaseTlsParameters {
    /// The path to the server certificate for TLS encryption.
    pub server_ca_path: String,
    /// The path to the client certificate for TLS encryption.
    pub client_cert_path: String,
    /// The path to the client key for TLS encryption.
    pub client_key_path: String,
}

/// Append-only store for readings.
pub trait Sink {
    /// Appends a record and returns the id the store assigned to it.
    fn append(&mut self, record: &PersistedRecord) -> Result<RecordId, SinkError>;

    /// The connection to the store is lost and has to be reopened before the next append.
    fn is_closed(&self) -> bool;

    /// Reopens a lost connection to the store.
    fn reopen(&mut self) -> Result<(), SinkError>;
}

/// Sink storing every reading as a JSONB row.
///
/// The write timestamp of a row is assigned by the database server.
pub struct PostgresSink
{
    client: Client,
    connection_parameters: DatabaseParameters,
    insert_statement: String,
}

impl PostgresSink {
    /// Connects to the database and creates the readings table if necessary.
    ///
    /// # Errors
    ///
    /// Errors occur when one of the following conditions is met:
    ///
    /// * TLS is enabled but no TLS parameters are given.
    ///
    /// * The files for the TLS connection cannot be found.
    ///
    /// * The connection cannot be established or the user is not authorized for the database.
    ///
    /// * The table cannot be created.
    ///
    pub fn connect(connection_parameters: &DatabaseParameters) -> Result<PostgresSink, SinkError> {
        let client = open_connection(connection_parameters)?;
        log::info!(target: "sensord::db", "Database connection established!");

        Ok(PostgresSink {
            client,
            connection_parameters: connection_parameters.clone(),
            insert_statement: table_statement(SQL_INSERT_RECORD, &connection_parameters.table),
        })
    }
}

impl Sink for PostgresSink {
    fn append(&mut self, record: &PersistedRecord) -> Result<RecordId, SinkError> {
        let data = Value::Object(record.data.clone());
        let row = self.client.query_one(self.insert_statement.as_str(), &[&data, &record.received_at])?;
        Ok(row.get("id"))
    }

    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    fn reopen(&mut self) -> Result<(), SinkError> {
        self.client = open_connection(&self.connection_parameters)?;
        log::info!(target: "sensord::db", "Database connection reestablished!");
        Ok(())
    }
}

fn table_statement(template: &str, table: &str) -> String {
    template.replace("{table}", table)
}

fn connection_string(connection_parameters: &DatabaseParameters) -> String {
    format!("user={} password={} host={} port={} dbname={} application_name=sensord connect_timeout={}",
            connection_parameters.username,
            connection_parameters.password,
            connection_parameters.hostname,
            connection_parameters.port,
            connection_parameters.database,
            CONNECT_TIMEOUT_SECONDS)
}

/// Builds the TLS connector, the server certificate is verified against `server_ca_path`.
fn tls_connector(tls_params: &DatabaseTlsParameters) -> Result<MakeTlsConnector, SinkError> {
    let mut ssl_connection_builder = SslConnector::builder(SslMethod::tls())?;
    ssl_connection_builder.set_verify(SslVerifyMode::PEER);
    ssl_connection_builder.set_ca_file(&tls_params.server_ca_path)?;
    ssl_connection_builder.set_certificate_file(&tls_params.client_cert_path, SslFiletype::PEM)?;
    ssl_connection_builder.set_private_key_file(&tls_params.client_key_path, SslFiletype::PEM)?;

    Ok(MakeTlsConnector::new(ssl_connection_builder.build()))
}

/// Opens a connection and creates the readings table if necessary.
fn open_connection(connection_parameters: &DatabaseParameters) -> Result<Client, SinkError> {
    let postgres_connection_string = connection_string(connection_parameters);

    let mut client = if !connection_parameters.tls_enable {
        Client::connect(postgres_connection_string.as_str(), postgres::NoTls)?
    } else {
        let tls_params = match &connection_parameters.tls_params {
            Some(tls_params) => tls_params,
            None => return Err(SinkError::Misconfigured(String::from("TLS enabled but no TLS parameters specified!"))),
        };
        Client::connect(postgres_connection_string.as_str(), tls_connector(tls_params)?)?
    };

    client.batch_execute(table_statement(SQL_CREATE_TABLE, &connection_parameters.table).as_str())?;
    log::debug!(target: "sensord::db", "Ensured table \'{}\' exists", connection_parameters.table);
    Ok(client)
}

fn append_reopening<S: Sink>(sink: &mut S, record: &PersistedRecord) -> Result<RecordId, SinkError> {
    if sink.is_closed() {
        log::warn!(target: "sensord::db", "Database connection lost, reconnecting...");
        sink.reopen()?;
    }
    sink.append(record)
}

/// Appends every record received on `requests` to `sink` and reports each outcome on `events`.
///
/// A lost connection is reopened before the next append, a failed reopen fails that append.
/// Returns once the request channel is closed, in-flight records are always completed first.
pub fn sink_worker<S: Sink>(sink: &mut S, requests: Receiver<PersistedRecord>, events: Sender<Event>)
{
    for record in requests.iter() {
        let result = append_reopening(sink, &record);
        if let Err(err) = &result {
            log::warn!(target: "sensord::db", "Database insert failed: \'{}\'", err);
        }
        if events.send(Event::PersistCompleted(result)).is_err() {
            log::error!(target: "sensord::db", "Could not report insert result, pipeline is gone!");
            return;
        }
    }
}

/// Thread function for the database connection.
///
/// This thread establishes a database connection and stores all records received on the request
/// channel in the database until the channel is closed.
///
/// # Arguments
///
/// * `requests` - The channel to receive the records to insert from.
///
/// * `events` - The channel the insert results are reported on.
///
/// * `thread_finish` - Set if the connection cannot be established.
///
/// * `connection_parameters` - Parameters for the database connection.
///
/// Connection errors result in the method immediately exiting and shutting down the pipeline.
///
pub fn database_thread(requests: Receiver<PersistedRecord>, events: Sender<Event>, thread_finish: Arc<AtomicBool>, connection_parameters: DatabaseParameters)
{
    let mut sink = match PostgresSink::connect(&connection_parameters) {
        Ok(sink) => sink,
        Err(err) => {
            log::error!(target: "sensord::db", "Could not establish database connection: \'{}\'", err);
            thread_finish.store(true, Ordering::SeqCst);
            let _ = events.send(Event::Shutdown);
            return;
        }
    };

    sink_worker(&mut sink, requests, events);
    log::info!(target: "sensord::db", "Closing database connection!");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Map};
    use std::sync::mpsc;

    #[derive(Default)]
    struct MemorySink
    {
        rows: Vec<PersistedRecord>,
        fail_next: bool,
        closed: bool,
        failed_reopens: u32,
        reopens: u32,
    }

    impl Sink for MemorySink {
        fn append(&mut self, record: &PersistedRecord) -> Result<RecordId, SinkError> {
            if self.closed {
                return Err(SinkError::Unavailable(String::from("connection closed")));
            }
            if self.fail_next {
                self.fail_next = false;
                return Err(SinkError::Unavailable(String::from("connection reset")));
            }
            self.rows.push(record.clone());
            Ok(self.rows.len() as RecordId)
        }

        fn is_closed(&self) -> bool {
            self.closed
        }

        fn reopen(&mut self) -> Result<(), SinkError> {
            self.reopens += 1;
            if self.failed_reopens > 0 {
                self.failed_reopens -= 1;
                return Err(SinkError::Unavailable(String::from("server is restarting")));
            }
            self.closed = false;
            Ok(())
        }
    }

    fn params(tls_enable: bool, tls_params: Option<DatabaseTlsParameters>) -> DatabaseParameters {
        DatabaseParameters {
            hostname: String::from("localhost"),
            port: 5432,
            username: String::from("sensord"),
            password: String::from("secret"),
            database: String::from("sensors"),
            table: default_table(),
            tls_enable,
            tls_params,
        }
    }

    fn record(temperature: i64) -> PersistedRecord {
        let mut data = Map::new();
        data.insert("temperature".to_string(), json!(temperature));
        PersistedRecord {
            data,
            received_at: Utc.timestamp_millis_opt(0).unwrap(),
        }
    }

    #[test]
    fn table_name_is_substituted() {
        let statement = table_statement(SQL_INSERT_RECORD, "greenhouse");
        assert!(statement.starts_with("INSERT INTO greenhouse (data, received_at)"));
        assert!(!statement.contains("{table}"));
        assert!(table_statement(SQL_CREATE_TABLE, "greenhouse").contains("IF NOT EXISTS greenhouse"));
    }

    #[test]
    fn worker_reports_every_result_in_order() {
        let (request_tx, request_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let mut sink = MemorySink { fail_next: true, ..MemorySink::default() };

        request_tx.send(record(20)).unwrap();
        request_tx.send(record(21)).unwrap();
        drop(request_tx);
        sink_worker(&mut sink, request_rx, event_tx);

        let results: Vec<Event> = event_rx.iter().collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[0], Event::PersistCompleted(Err(SinkError::Unavailable(_)))));
        assert!(matches!(results[1], Event::PersistCompleted(Ok(1))));
        assert_eq!(sink.rows, vec![record(21)]);
    }

    #[test]
    fn worker_stops_when_pipeline_is_gone() {
        let (request_tx, request_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        drop(event_rx);
        let mut sink = MemorySink::default();

        request_tx.send(record(20)).unwrap();
        request_tx.send(record(21)).unwrap();
        sink_worker(&mut sink, request_rx, event_tx);
        assert_eq!(sink.rows.len(), 1);
    }

    #[test]
    fn lost_connection_is_reopened_before_append() {
        let (request_tx, request_rx) = mpsc::channel();
        let (event_tx, event_rx) = mpsc::channel();
        let mut sink = MemorySink { closed: true, failed_reopens: 1, ..MemorySink::default() };

        request_tx.send(record(20)).unwrap();
        request_tx.send(record(21)).unwrap();
        request_tx.send(record(22)).unwrap();
        drop(request_tx);
        sink_worker(&mut sink, request_rx, event_tx);

        let results: Vec<Event> = event_rx.iter().collect();
        assert_eq!(results.len(), 3);
        assert!(matches!(results[0], Event::PersistCompleted(Err(SinkError::Unavailable(_)))));
        assert!(matches!(results[1], Event::PersistCompleted(Ok(1))));
        assert!(matches!(results[2], Event::PersistCompleted(Ok(2))));
        assert_eq!(sink.reopens, 2);
        assert_eq!(sink.rows, vec![record(21), record(22)]);
    }

    #[test]
    fn connection_string_carries_connect_timeout() {
        let connection_string = connection_string(&params(false, None));
        assert!(connection_string.contains("host=localhost port=5432 dbname=sensors"));
        assert!(connection_string.ends_with("connect_timeout=10"));
    }

    #[test]
    fn tls_without_parameters_is_refused() {
        assert!(matches!(PostgresSink::connect(&params(true, None)), Err(SinkError::Misconfigured(_))));
    }

    #[test]
    fn missing_ca_file_is_a_tls_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = |name: &str| dir.path().join(name).to_str().unwrap().to_string();
        let tls_params = DatabaseTlsParameters {
            server_ca_path: missing("ca.pem"),
            client_cert_path: missing("client.pem"),
            client_key_path: missing("client.key"),
        };
        assert!(matches!(tls_connector(&tls_params), Err(SinkError::Tls(_))));
        assert!(matches!(PostgresSink::connect(&params(true, Some(tls_params))), Err(SinkError::Tls(_))));
    }
}
