use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;

use crate::adapters::mqtt::{
    Connector, DeliveryQos, InboundMessage, Transport, TransportError, with_connection,
};
use crate::app::services::{
    LogEventDraft, ServiceError, SessionCommandHandler, SessionQueryHandler, record_log_event,
};
use crate::domain::command_payload::{
    StationCommand, StatusSignal, TopicLayout, parse_status_payload,
};
use crate::domain::session_state::Clock;

const LOG_SOURCE: &str = "heartbeat";
const LISTENER_PUMP_SLICE: Duration = Duration::from_secs(1);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReport {
    pub replies: usize,
    pub touched: usize,
    pub marked_offline: usize,
    pub stale_marked_offline: usize,
    pub apply_failed: usize,
    pub probe_failed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Touched,
    MarkedOffline,
    Ignored,
}

pub struct HeartbeatMonitor<S, C, K> {
    store: S,
    connector: C,
    clock: K,
    topics: TopicLayout,
    probe_window: Duration,
    stale_after_seconds: i64,
}

impl<S, C, K> HeartbeatMonitor<S, C, K>
where
    S: SessionQueryHandler + SessionCommandHandler,
    C: Connector,
    K: Clock,
{
    pub fn new(
        store: S,
        connector: C,
        clock: K,
        topics: TopicLayout,
        probe_window: Duration,
        stale_after_seconds: i64,
    ) -> Self {
        Self {
            store,
            connector,
            clock,
            topics,
            probe_window,
            stale_after_seconds,
        }
    }

    /// Probes every station once, then flips silent stations offline. The
    /// sweep runs even when the broker is unreachable so admission never
    /// trusts a heartbeat nobody refreshed.
    pub fn probe_cycle(&self) -> Result<ProbeReport, ServiceError> {
        let mut report = ProbeReport::default();

        match self.collect_replies() {
            Ok(replies) => {
                report.replies = replies.len();
                for (station_id, signal) in replies {
                    match self.apply_signal(&station_id, signal) {
                        Ok(Applied::Touched) => report.touched += 1,
                        Ok(Applied::MarkedOffline) => report.marked_offline += 1,
                        Ok(Applied::Ignored) => {}
                        Err(error) => {
                            report.apply_failed += 1;
                            tracing::warn!(
                                station_id = %station_id,
                                error = %error,
                                "failed to record probe reply"
                            );
                        }
                    }
                }
            }
            Err(error) => {
                report.probe_failed = true;
                tracing::warn!(error = %error, "heartbeat probe skipped");
                record_log_event(
                    &self.store,
                    self.clock.now(),
                    LogEventDraft {
                        level: "warn",
                        code: "heartbeat.probe_failed",
                        message: error.to_string(),
                        source: LOG_SOURCE,
                        station_id: None,
                        session_id: None,
                        details: None,
                    },
                );
            }
        }

        let stale_before = self.clock.now().minus_seconds(self.stale_after_seconds);
        report.stale_marked_offline = self.store.mark_stale_stations_offline(stale_before)?;

        tracing::info!(
            replies = report.replies,
            touched = report.touched,
            marked_offline = report.marked_offline,
            stale_marked_offline = report.stale_marked_offline,
            apply_failed = report.apply_failed,
            probe_failed = report.probe_failed,
            "heartbeat probe cycle finished"
        );

        Ok(report)
    }

    /// Last signal per station within the window wins. Retained liveness is
    /// dropped: it may be hours old and says nothing about the station now.
    fn collect_replies(&self) -> Result<BTreeMap<String, StatusSignal>, TransportError> {
        let receiver = with_connection(&self.connector, |connection| {
            let (sender, receiver) = mpsc::channel();
            connection.subscribe(&self.topics.status_filter(), sender)?;
            connection.publish(
                &self.topics.broadcast_topic(),
                StationCommand::ping(self.clock.now()).to_payload(),
                DeliveryQos::AtMostOnce,
                false,
            )?;
            connection.pump(self.probe_window)?;
            Ok::<Receiver<InboundMessage>, TransportError>(receiver)
        })?;

        let mut replies = BTreeMap::new();
        for message in receiver.try_iter() {
            if let Some((station_id, signal)) = self.classify(&message) {
                replies.insert(station_id.to_string(), signal);
            }
        }
        Ok(replies)
    }

    pub fn apply_message(&self, message: &InboundMessage) -> Result<Applied, ServiceError> {
        match self.classify(message) {
            Some((station_id, signal)) => self.apply_signal(station_id, signal),
            None => Ok(Applied::Ignored),
        }
    }

    fn classify<'m>(&self, message: &'m InboundMessage) -> Option<(&'m str, StatusSignal)> {
        let station_id = self.topics.station_from_status_topic(&message.topic)?;
        let signal = parse_status_payload(&message.payload)?;

        if message.retained && signal == StatusSignal::Alive {
            tracing::debug!(station_id, "ignoring retained liveness message");
            return None;
        }
        Some((station_id, signal))
    }

    fn apply_signal(
        &self,
        station_id: &str,
        signal: StatusSignal,
    ) -> Result<Applied, ServiceError> {
        let affected = match signal {
            StatusSignal::Alive => self
                .store
                .touch_station_heartbeat(station_id, self.clock.now())?,
            StatusSignal::Offline => self.store.mark_station_offline(station_id)?,
        };

        if affected == 0 {
            tracing::debug!(station_id, ?signal, "status signal matched no station update");
            return Ok(Applied::Ignored);
        }

        match signal {
            StatusSignal::Alive => {
                tracing::debug!(station_id, "heartbeat recorded");
                Ok(Applied::Touched)
            }
            StatusSignal::Offline => {
                tracing::info!(station_id, "station reported offline");
                record_log_event(
                    &self.store,
                    self.clock.now(),
                    LogEventDraft {
                        level: "info",
                        code: "heartbeat.offline",
                        message: "station announced offline".to_string(),
                        source: LOG_SOURCE,
                        station_id: Some(station_id),
                        session_id: None,
                        details: Some(json!({ "topic": self.topics.status_topic(station_id) })),
                    },
                );
                Ok(Applied::MarkedOffline)
            }
        }
    }
}

/// Push-mode listener. The I/O thread only forwards messages over a channel;
/// a worker thread applies them to the store so a slow write never stalls
/// the broker keep-alive.
pub fn start_status_listener<S, C, K>(
    monitor: Arc<HeartbeatMonitor<S, C, K>>,
    retry_interval: Duration,
    stop_flag: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    S: SessionQueryHandler + SessionCommandHandler + Send + Sync + 'static,
    C: Connector,
    K: Clock + Send + Sync + 'static,
{
    let (sender, receiver) = mpsc::channel::<InboundMessage>();

    let worker_monitor = Arc::clone(&monitor);
    let worker = std::thread::spawn(move || {
        for message in receiver {
            if let Err(error) = worker_monitor.apply_message(&message) {
                tracing::warn!(
                    topic = %message.topic,
                    error = %error,
                    "failed to apply status message"
                );
            }
        }
    });

    std::thread::spawn(move || {
        while !stop_flag.load(Ordering::Relaxed) {
            match listen(&monitor, &sender, &stop_flag) {
                Ok(()) => break,
                Err(error) => {
                    tracing::warn!(
                        error = %error,
                        retry_ms = retry_interval.as_millis() as u64,
                        "status listener disconnected; retrying"
                    );
                    sleep_unless_stopped(retry_interval, &stop_flag);
                }
            }
        }

        drop(sender);
        if worker.join().is_err() {
            tracing::error!("status worker thread panicked");
        }
        tracing::info!("status listener stopped");
    })
}

fn listen<S, C, K>(
    monitor: &HeartbeatMonitor<S, C, K>,
    sender: &mpsc::Sender<InboundMessage>,
    stop_flag: &AtomicBool,
) -> Result<(), TransportError>
where
    C: Connector,
{
    let filter = monitor.topics.status_filter();
    with_connection(&monitor.connector, |connection| {
        connection.subscribe(&filter, sender.clone())?;
        tracing::info!(filter = %filter, "status listener subscribed");

        while !stop_flag.load(Ordering::Relaxed) {
            connection.pump(LISTENER_PUMP_SLICE)?;
        }
        Ok(())
    })
}

fn sleep_unless_stopped(duration: Duration, stop_flag: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !stop_flag.load(Ordering::Relaxed) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        std::thread::sleep(remaining.min(STOP_POLL_INTERVAL));
    }
}
