use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};

use rumqttc::mqttbytes;
use rumqttc::{
    Client, Connection, ConnectionError, Event, MqttOptions, Outgoing, Packet, Publish, QoS,
    RecvTimeoutError,
};
use thiserror::Error;

const EVENT_CHANNEL_CAPACITY: usize = 32;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),
    #[error("station did not respond: {0}")]
    Hardware(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryQos {
    AtMostOnce,
    AtLeastOnce,
}

impl From<DeliveryQos> for QoS {
    fn from(value: DeliveryQos) -> Self {
        match value {
            DeliveryQos::AtMostOnce => QoS::AtMostOnce,
            DeliveryQos::AtLeastOnce => QoS::AtLeastOnce,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Replayed by the broker from its retained store rather than sent live.
    pub retained: bool,
}

/// One live broker session. Inbound messages are handed to subscriber
/// channels; nothing slower than a channel send runs on the I/O path.
pub trait Transport {
    fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: DeliveryQos,
        retain: bool,
    ) -> Result<(), TransportError>;

    fn subscribe(
        &mut self,
        filter: &str,
        sink: Sender<InboundMessage>,
    ) -> Result<(), TransportError>;

    /// Drives the I/O loop for `window`, dispatching inbound messages.
    fn pump(&mut self, window: Duration) -> Result<(), TransportError>;

    /// Best-effort close; safe to call more than once.
    fn disconnect(&mut self);
}

pub trait Connector: Send + Sync + 'static {
    type Connection: Transport;

    fn connect(&self) -> Result<Self::Connection, TransportError>;
}

/// Opens a connection, runs `op`, and disconnects on every exit path.
pub fn with_connection<C, T, E>(
    connector: &C,
    op: impl FnOnce(&mut C::Connection) -> Result<T, E>,
) -> Result<T, E>
where
    C: Connector,
    E: From<TransportError>,
{
    let mut connection = connector.connect()?;
    let result = op(&mut connection);
    connection.disconnect();
    result
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
    pub publish_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct MqttConnector {
    settings: MqttSettings,
}

impl MqttConnector {
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    fn options(&self) -> MqttOptions {
        let client_id = format!(
            "{}-{}",
            self.settings.client_id_prefix,
            uuid::Uuid::new_v4().simple()
        );
        let mut options = MqttOptions::new(client_id, &self.settings.host, self.settings.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);

        if let Some(username) = &self.settings.username {
            options.set_credentials(
                username.clone(),
                self.settings.password.clone().unwrap_or_default(),
            );
        }

        options
    }
}

impl Connector for MqttConnector {
    type Connection = MqttTransport;

    fn connect(&self) -> Result<MqttTransport, TransportError> {
        let (client, connection) = Client::new(self.options(), EVENT_CHANNEL_CAPACITY);
        let mut transport = MqttTransport {
            client,
            connection,
            publish_timeout: self.settings.publish_timeout,
            subscriptions: Vec::new(),
            closed: false,
        };

        transport.await_connack(self.settings.connect_timeout)?;

        tracing::debug!(
            host = %self.settings.host,
            port = self.settings.port,
            "mqtt connection established"
        );
        Ok(transport)
    }
}

pub struct MqttTransport {
    client: Client,
    connection: Connection,
    publish_timeout: Duration,
    subscriptions: Vec<(String, Sender<InboundMessage>)>,
    closed: bool,
}

enum Poll {
    Event(Event),
    Failed(ConnectionError),
    TimedOut,
    Closed,
}

impl MqttTransport {
    fn poll_until(&mut self, deadline: Instant) -> Poll {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Poll::TimedOut;
        }

        match self.connection.recv_timeout(remaining) {
            Ok(Ok(event)) => Poll::Event(event),
            Ok(Err(error)) => Poll::Failed(error),
            Err(RecvTimeoutError::Timeout) => Poll::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Poll::Closed,
        }
    }

    fn await_connack(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.poll_until(deadline) {
                Poll::Event(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Poll::Event(_) => {}
                Poll::Failed(error) => return Err(TransportError::Connect(error.to_string())),
                Poll::TimedOut => {
                    return Err(TransportError::Connect(format!(
                        "no CONNACK within {}ms",
                        timeout.as_millis()
                    )));
                }
                Poll::Closed => {
                    return Err(TransportError::Connect(
                        "event loop closed during handshake".to_string(),
                    ));
                }
            }
        }
    }

    fn dispatch(&self, publish: &Publish) {
        for (filter, sink) in &self.subscriptions {
            if !mqttbytes::matches(&publish.topic, filter) {
                continue;
            }

            let message = InboundMessage {
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
                retained: publish.retain,
            };
            if sink.send(message).is_err() {
                tracing::debug!(filter = %filter, "subscriber channel closed; dropping message");
            }
        }
    }
}

impl Transport for MqttTransport {
    fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: DeliveryQos,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.client
            .publish(topic, qos.into(), retain, payload)
            .map_err(|error| TransportError::Hardware(error.to_string()))?;

        let deadline = Instant::now() + self.publish_timeout;
        let mut packet_id = None;

        loop {
            match self.poll_until(deadline) {
                Poll::Event(Event::Outgoing(Outgoing::Publish(id))) => {
                    if qos == DeliveryQos::AtMostOnce {
                        return Ok(());
                    }
                    packet_id = Some(id);
                }
                Poll::Event(Event::Incoming(Packet::PubAck(ack))) if packet_id == Some(ack.pkid) => {
                    return Ok(());
                }
                Poll::Event(Event::Incoming(Packet::Publish(publish))) => self.dispatch(&publish),
                Poll::Event(_) => {}
                Poll::Failed(error) => return Err(TransportError::Hardware(error.to_string())),
                Poll::TimedOut => {
                    return Err(TransportError::Hardware(format!(
                        "publish to {topic} not acknowledged within {}ms",
                        self.publish_timeout.as_millis()
                    )));
                }
                Poll::Closed => {
                    return Err(TransportError::Hardware(
                        "connection closed before acknowledgement".to_string(),
                    ));
                }
            }
        }
    }

    fn subscribe(
        &mut self,
        filter: &str,
        sink: Sender<InboundMessage>,
    ) -> Result<(), TransportError> {
        self.client
            .subscribe(filter, QoS::AtMostOnce)
            .map_err(|error| TransportError::Connect(error.to_string()))?;
        self.subscriptions.push((filter.to_string(), sink));

        let deadline = Instant::now() + self.publish_timeout;
        loop {
            match self.poll_until(deadline) {
                Poll::Event(Event::Incoming(Packet::SubAck(_))) => return Ok(()),
                Poll::Event(Event::Incoming(Packet::Publish(publish))) => self.dispatch(&publish),
                Poll::Event(_) => {}
                Poll::Failed(error) => return Err(TransportError::Connect(error.to_string())),
                Poll::TimedOut | Poll::Closed => {
                    return Err(TransportError::Connect(format!(
                        "subscription to {filter} not acknowledged"
                    )));
                }
            }
        }
    }

    fn pump(&mut self, window: Duration) -> Result<(), TransportError> {
        let deadline = Instant::now() + window;

        loop {
            match self.poll_until(deadline) {
                Poll::Event(Event::Incoming(Packet::Publish(publish))) => self.dispatch(&publish),
                Poll::Event(_) => {}
                Poll::Failed(error) => return Err(TransportError::Connect(error.to_string())),
                Poll::TimedOut => return Ok(()),
                Poll::Closed => {
                    return Err(TransportError::Connect("event loop closed".to_string()));
                }
            }
        }
    }

    fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(error) = self.client.disconnect() {
            tracing::debug!(error = %error, "mqtt disconnect request failed");
            return;
        }

        let deadline = Instant::now() + DISCONNECT_FLUSH;
        loop {
            match self.poll_until(deadline) {
                Poll::Event(Event::Outgoing(Outgoing::Disconnect)) => break,
                Poll::Event(_) => {}
                Poll::Failed(_) | Poll::TimedOut | Poll::Closed => break,
            }
        }
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use crate::test_support::StubConnector;

    use super::{Connector, DeliveryQos, Transport, TransportError, with_connection};

    #[test]
    fn with_connection_disconnects_on_success_and_failure() {
        let connector = StubConnector::new();

        let ok: Result<(), TransportError> = with_connection(&connector, |connection| {
            connection.publish(
                "stations/S1/command",
                b"{}".to_vec(),
                DeliveryQos::AtLeastOnce,
                false,
            )
        });
        assert!(ok.is_ok());

        connector.fail_publishes("timeout");
        let failed: Result<(), TransportError> = with_connection(&connector, |connection| {
            connection.publish(
                "stations/S1/command",
                b"{}".to_vec(),
                DeliveryQos::AtLeastOnce,
                false,
            )
        });
        assert!(matches!(failed, Err(TransportError::Hardware(_))));

        assert_eq!(connector.connects(), 2);
        assert_eq!(connector.disconnects(), 2);
    }

    #[test]
    fn connect_failure_skips_operation() {
        let connector = StubConnector::new();
        connector.fail_connects("connection refused");

        let mut ran = false;
        let result: Result<(), TransportError> = with_connection(&connector, |_| {
            ran = true;
            Ok(())
        });

        assert!(matches!(result, Err(TransportError::Connect(_))));
        assert!(!ran);
        assert!(connector.published().is_empty());
    }

    #[test]
    fn pump_dispatches_only_matching_messages() {
        let connector = StubConnector::new();
        connector.queue_inbound("petwash/S1/status", b"online", false);
        connector.queue_inbound("other/S2/status", b"online", false);

        let (sender, receiver) = mpsc::channel();
        let mut connection = connector.connect().expect("stub connect");
        connection
            .subscribe("petwash/+/status", sender)
            .expect("subscribe");
        connection
            .pump(Duration::from_millis(1))
            .expect("pump should succeed");
        connection.disconnect();

        let received: Vec<_> = receiver.try_iter().collect();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].topic, "petwash/S1/status");
    }

    #[test]
    fn multi_level_wildcard_skips_parent_and_system_topics() {
        let connector = StubConnector::new();
        connector.queue_inbound("petwash", b"online", false);
        connector.queue_inbound("$SYS/broker/uptime", b"12", false);
        connector.queue_inbound("petwash/S1/status", b"online", false);

        let (sender, receiver) = mpsc::channel();
        let mut connection = connector.connect().expect("stub connect");
        connection.subscribe("petwash/#", sender.clone()).expect("subscribe");
        connection.subscribe("#", sender).expect("subscribe");
        connection
            .pump(Duration::from_millis(1))
            .expect("pump should succeed");
        connection.disconnect();

        let topics: Vec<String> = receiver.try_iter().map(|message| message.topic).collect();
        assert_eq!(topics, vec!["petwash/S1/status", "petwash/S1/status"]);
    }
}
