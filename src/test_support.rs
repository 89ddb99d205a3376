use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rumqttc::mqttbytes;
use rusqlite::Connection;

use crate::adapters::db::{open_connection, run_migrations, upsert_station};
use crate::adapters::mqtt::{Connector, DeliveryQos, InboundMessage, Transport, TransportError};
use crate::domain::models::{
    NewWashSession, ServiceOption, Station, StationCapabilities, StationStatus,
};
use crate::domain::session_state::{Clock, TimestampMs};

static TEST_DB_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 2023-11-14T22:13:20.000Z
pub const T0: TimestampMs = TimestampMs(1_700_000_000_000);

pub fn open_test_connection(test_name: &str) -> Connection {
    let template = ensure_template_db();
    let test_db_path = unique_test_db_path(test_name);

    if let Some(parent) = test_db_path.parent() {
        std::fs::create_dir_all(parent).expect("test db dir should be creatable");
    }

    std::fs::copy(&template, &test_db_path).expect("template db should be copied");
    open_connection(test_db_path.to_string_lossy().as_ref()).expect("test db should open")
}

pub fn open_shared_test_connection(test_name: &str) -> Arc<Mutex<Connection>> {
    Arc::new(Mutex::new(open_test_connection(test_name)))
}

fn ensure_template_db() -> PathBuf {
    static TEMPLATE_PATH: OnceLock<PathBuf> = OnceLock::new();

    TEMPLATE_PATH
        .get_or_init(|| {
            let dir = tempfile::tempdir().expect("tempdir should be created");
            let template_path = dir.path().join("petwash_template.db");
            std::mem::forget(dir);

            let mut connection = open_connection(template_path.to_string_lossy().as_ref())
                .expect("template db opens");
            run_migrations(&mut connection).expect("template migrations should succeed");

            template_path
        })
        .clone()
}

fn unique_test_db_path(test_name: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let counter = TEST_DB_COUNTER.fetch_add(1, Ordering::Relaxed);
    Path::new("./target/testdb")
        .join(format!("{test_name}-{now}-{counter}.sqlite"))
        .to_path_buf()
}

pub fn station_with_heartbeat(id: &str, last_heartbeat_at: Option<TimestampMs>) -> Station {
    Station {
        id: id.to_string(),
        status: StationStatus::Available,
        last_heartbeat_at,
        capabilities: StationCapabilities::default(),
        options: vec![
            ServiceOption {
                option_id: 1,
                name: "Quick rinse".to_string(),
                price_cents: 500,
                duration_seconds: 120,
            },
            ServiceOption {
                option_id: 2,
                name: "Full wash".to_string(),
                price_cents: 1_000,
                duration_seconds: 300,
            },
        ],
    }
}

pub fn seed_station(connection: &mut Connection, station: &Station) {
    upsert_station(connection, station).expect("station seed should succeed");
}

/// Row as the payment authority would create it for option 2.
pub fn new_session_at(station_id: &str, created_at: TimestampMs) -> NewWashSession {
    NewWashSession {
        station_id: station_id.to_string(),
        user_id: Some("user-1".to_string()),
        option_id: 2,
        option_name: "Full wash".to_string(),
        duration_seconds: 300,
        placeholder_ends_at: created_at.plus_seconds(300),
        payment_ref: Some("cs_test_123".to_string()),
        created_at,
    }
}

#[derive(Debug, Clone)]
pub struct FixedClock {
    now: Arc<Mutex<TimestampMs>>,
}

impl FixedClock {
    pub fn at(now: TimestampMs) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: TimestampMs) {
        *self.now.lock().expect("clock lock") = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> TimestampMs {
        *self.now.lock().expect("clock lock")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: DeliveryQos,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).expect("published payload should be json")
    }
}

#[derive(Debug, Default)]
struct StubState {
    connect_error: Option<String>,
    publish_error: Option<String>,
    published: Vec<PublishedMessage>,
    inbound: Vec<InboundMessage>,
    connects: usize,
    disconnects: usize,
}

/// Scripted broker: records publishes and replays queued inbound messages on
/// the first pump of each connection.
#[derive(Debug, Clone, Default)]
pub struct StubConnector {
    state: Arc<Mutex<StubState>>,
}

impl StubConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.state.lock().expect("stub state lock")
    }

    pub fn fail_connects(&self, reason: &str) {
        self.lock().connect_error = Some(reason.to_string());
    }

    pub fn fail_publishes(&self, reason: &str) {
        self.lock().publish_error = Some(reason.to_string());
    }

    pub fn recover(&self) {
        let mut state = self.lock();
        state.connect_error = None;
        state.publish_error = None;
    }

    pub fn queue_inbound(&self, topic: &str, payload: &[u8], retained: bool) {
        self.lock().inbound.push(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retained,
        });
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, topic: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|message| message.topic == topic)
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn disconnects(&self) -> usize {
        self.lock().disconnects
    }
}

impl Connector for StubConnector {
    type Connection = StubConnection;

    fn connect(&self) -> Result<StubConnection, TransportError> {
        let mut state = self.lock();
        if let Some(reason) = &state.connect_error {
            return Err(TransportError::Connect(reason.clone()));
        }
        state.connects += 1;

        Ok(StubConnection {
            state: Arc::clone(&self.state),
            subscriptions: Vec::new(),
            closed: false,
        })
    }
}

pub struct StubConnection {
    state: Arc<Mutex<StubState>>,
    subscriptions: Vec<(String, Sender<InboundMessage>)>,
    closed: bool,
}

impl Transport for StubConnection {
    fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: DeliveryQos,
        retain: bool,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().expect("stub state lock");
        if let Some(reason) = &state.publish_error {
            return Err(TransportError::Hardware(reason.clone()));
        }

        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    fn subscribe(
        &mut self,
        filter: &str,
        sink: Sender<InboundMessage>,
    ) -> Result<(), TransportError> {
        self.subscriptions.push((filter.to_string(), sink));
        Ok(())
    }

    fn pump(&mut self, _window: Duration) -> Result<(), TransportError> {
        let inbound = std::mem::take(&mut self.state.lock().expect("stub state lock").inbound);

        for message in inbound {
            for (filter, sink) in &self.subscriptions {
                if mqttbytes::matches(&message.topic, filter) {
                    let _ = sink.send(message.clone());
                }
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        if !self.closed {
            self.closed = true;
            self.state.lock().expect("stub state lock").disconnects += 1;
        }
    }
}

impl Drop for StubConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
