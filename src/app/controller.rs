use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::adapters::db::StepUpdate;
use crate::adapters::mqtt::{Connector, DeliveryQos, Transport, TransportError, with_connection};
use crate::app::services::{
    LogEventDraft, ServiceError, SessionCommandHandler, SessionQueryHandler, record_log_event,
};
use crate::domain::command_payload::{StationCommand, TopicLayout};
use crate::domain::heartbeat::{AdmissionError, check_admission};
use crate::domain::models::{
    NewWashSession, SessionStatus, SessionStep, SessionTiming, Station, StopReason, WashSession,
};
use crate::domain::session_state::{
    Clock, PhaseDurations, TimestampMs, TransitionError, check_advance, check_startable,
    step_after_timer,
};

const LOG_SOURCE: &str = "controller";

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("station {0} not found")]
    StationNotFound(String),
    #[error("station {station_id} does not offer option {option_id}")]
    UnknownOption { station_id: String, option_id: i64 },
    #[error("station not admitted: {0}")]
    Admission(#[from] AdmissionError),
    #[error("session is already {0}")]
    SessionClosed(SessionStatus),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("session {session_id} is no longer in step {expected}")]
    Conflict {
        session_id: String,
        expected: SessionStep,
    },
    #[error("failed to connect to broker: {0}")]
    Connect(String),
    #[error("station did not respond: {0}")]
    Hardware(String),
    #[error("session store failed: {0}")]
    Store(#[from] ServiceError),
}

impl From<TransportError> for ControllerError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Connect(message) => Self::Connect(message),
            TransportError::Hardware(message) => Self::Hardware(message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started(SessionTiming),
    /// The hardware was already actuated by an earlier call; nothing was sent.
    AlreadyRunning(SessionTiming),
}

impl StartOutcome {
    pub fn timing(&self) -> SessionTiming {
        match self {
            Self::Started(timing) | Self::AlreadyRunning(timing) => *timing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOutcome {
    pub step: SessionStep,
    pub status: SessionStatus,
    pub off_sent: bool,
    /// Another writer closed the row between the OFF and the update.
    pub already_closed: bool,
    /// Stopped by the customer before the paid time ran out.
    pub non_refundable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvanceOutcome {
    pub step: SessionStep,
    pub status: SessionStatus,
    pub phase_ends_at: Option<TimestampMs>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortOutcome {
    Cancelled,
    Expired,
}

impl AbortOutcome {
    fn status(self) -> SessionStatus {
        match self {
            Self::Cancelled => SessionStatus::Cancelled,
            Self::Expired => SessionStatus::Expired,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSessionRequest {
    pub station_id: String,
    pub option_id: i64,
    pub user_id: Option<String>,
    pub payment_ref: Option<String>,
}

/// Owns a wash session from payment to rating. Holds no per-session state:
/// every decision is re-read from the store and every write is conditional.
pub struct SessionController<S, C, K> {
    store: S,
    connector: C,
    clock: K,
    topics: TopicLayout,
    phases: PhaseDurations,
}

impl<S, C, K> SessionController<S, C, K>
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
        phases: PhaseDurations,
    ) -> Self {
        Self {
            store,
            connector,
            clock,
            topics,
            phases,
        }
    }

    pub fn admit(&self, station_id: &str) -> Result<Station, ControllerError> {
        let station = self
            .store
            .get_station(station_id)?
            .ok_or_else(|| AdmissionError::UnknownStation(station_id.to_string()))?;

        if let Err(error) = check_admission(&station, self.clock.now()) {
            tracing::info!(station_id, reason = %error, "station admission rejected");
            return Err(error.into());
        }

        Ok(station)
    }

    /// Entry point for the payment authority: snapshots the chosen option so
    /// later catalog edits cannot change the paid duration.
    pub fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<WashSession, ControllerError> {
        let station = self.admit(&request.station_id)?;
        let option = station
            .option(request.option_id)
            .ok_or_else(|| ControllerError::UnknownOption {
                station_id: station.id.clone(),
                option_id: request.option_id,
            })?;

        let now = self.clock.now();
        let session_id = self.store.insert_session(&NewWashSession {
            station_id: station.id.clone(),
            user_id: request.user_id.clone(),
            option_id: option.option_id,
            option_name: option.name.clone(),
            duration_seconds: option.duration_seconds,
            placeholder_ends_at: now.plus_seconds(option.duration_seconds),
            payment_ref: request.payment_ref.clone(),
            created_at: now,
        })?;

        tracing::info!(
            session_id = %session_id,
            station_id = %station.id,
            option_id = option.option_id,
            duration_seconds = option.duration_seconds,
            "wash session created"
        );

        self.load_session(&session_id)
    }

    pub fn start(&self, session_id: &str) -> Result<StartOutcome, ControllerError> {
        let session = self.load_session(session_id)?;
        if session.status != SessionStatus::Active {
            return Err(ControllerError::SessionClosed(session.status));
        }
        if let Some(timing) = running_timing(&session) {
            tracing::info!(session_id, step = %session.step, "duplicate start ignored");
            return Ok(StartOutcome::AlreadyRunning(timing));
        }

        let station = self.load_station(&session.station_id)?;
        check_startable(&station.capabilities, session.step)?;

        let started_at = self.clock.now();
        let ends_at = started_at.plus_seconds(session.duration_seconds);
        let command = StationCommand::start(session.duration_seconds, started_at);

        if let Err(error) = self.send_command(&session.station_id, &command) {
            self.record_hardware_failure(&session, "controller.start.failed", &error);
            return Err(error.into());
        }

        let affected = self
            .store
            .mark_session_started(session_id, started_at, ends_at)?;

        if affected == 0 {
            let current = self.load_session(session_id)?;
            if current.status == SessionStatus::Active
                && let Some(timing) = running_timing(&current)
            {
                tracing::warn!(
                    session_id,
                    "concurrent start won the race; keeping persisted timing"
                );
                return Ok(StartOutcome::AlreadyRunning(timing));
            }

            return Err(ControllerError::Conflict {
                session_id: session_id.to_string(),
                expected: session.step,
            });
        }

        self.update_occupancy(&session.station_id, Occupancy::Busy);

        tracing::info!(
            session_id,
            station_id = %session.station_id,
            started_at = %started_at.to_rfc3339(),
            ends_at = %ends_at.to_rfc3339(),
            "wash session started"
        );

        Ok(StartOutcome::Started(SessionTiming {
            started_at,
            ends_at,
        }))
    }

    pub fn stop(
        &self,
        session_id: &str,
        reason: StopReason,
    ) -> Result<StopOutcome, ControllerError> {
        let session = self.load_session(session_id)?;

        if session.status != SessionStatus::Active
            || session.step.is_post_run()
            || session.step == SessionStep::Rating
        {
            return Ok(StopOutcome {
                step: session.step,
                status: session.status,
                off_sent: false,
                already_closed: false,
                non_refundable: false,
            });
        }

        let station = self.load_station(&session.station_id)?;
        let next_step = step_after_timer(&station.capabilities);

        if session.step != SessionStep::Timer {
            return Err(TransitionError::NotAllowed {
                from: session.step,
                to: next_step,
            }
            .into());
        }

        let now = self.clock.now();
        if let Err(error) = self.send_command(&session.station_id, &StationCommand::off(now)) {
            self.record_hardware_failure(&session, "controller.stop.failed", &error);
            return Err(error.into());
        }

        let status = if next_step == SessionStep::Rating {
            SessionStatus::Completed
        } else {
            SessionStatus::Active
        };
        let affected = self.store.update_session_step(
            session_id,
            &StepUpdate {
                from: SessionStep::Timer,
                to: next_step,
                phase_ends_at: self.phase_end(next_step, now),
                status,
                stop_reason: Some(reason),
            },
            now,
        )?;

        self.update_occupancy(&session.station_id, Occupancy::Released(now));

        if affected == 0 {
            let current = self.load_session(session_id)?;
            tracing::info!(
                session_id,
                step = %current.step,
                status = %current.status,
                "session closed concurrently while stopping"
            );
            return Ok(StopOutcome {
                step: current.step,
                status: current.status,
                off_sent: true,
                already_closed: true,
                non_refundable: false,
            });
        }

        let non_refundable = reason == StopReason::Manual && now < session.ends_at;
        if non_refundable {
            tracing::info!(
                session_id,
                remaining_seconds = session.ends_at.seconds_since(now),
                "manual stop before paid time elapsed; remaining time is not refunded"
            );
        }

        tracing::info!(
            session_id,
            station_id = %session.station_id,
            reason = reason.as_str(),
            step = %next_step,
            "wash session stopped"
        );

        Ok(StopOutcome {
            step: next_step,
            status,
            off_sent: true,
            already_closed: false,
            non_refundable,
        })
    }

    pub fn advance(
        &self,
        session_id: &str,
        from: SessionStep,
        to: SessionStep,
    ) -> Result<AdvanceOutcome, ControllerError> {
        let session = self.load_session(session_id)?;
        if session.status != SessionStatus::Active {
            return Err(ControllerError::SessionClosed(session.status));
        }

        let station = self.load_station(&session.station_id)?;
        check_advance(&station.capabilities, from, to)?;

        let conflict = || ControllerError::Conflict {
            session_id: session_id.to_string(),
            expected: from,
        };
        if session.step != from {
            return Err(conflict());
        }

        let now = self.clock.now();
        let status = if to == SessionStep::Rating {
            SessionStatus::Completed
        } else {
            SessionStatus::Active
        };
        let phase_ends_at = self.phase_end(to, now);

        let affected = self.store.update_session_step(
            session_id,
            &StepUpdate {
                from,
                to,
                phase_ends_at,
                status,
                stop_reason: None,
            },
            now,
        )?;
        if affected == 0 {
            return Err(conflict());
        }

        tracing::info!(session_id, from = %from, to = %to, "session step advanced");

        Ok(AdvanceOutcome {
            step: to,
            status,
            phase_ends_at,
        })
    }

    /// Terminal close after an irrecoverable hardware failure. The refund is
    /// the business layer's call; this only records the outcome.
    pub fn abort(
        &self,
        session_id: &str,
        outcome: AbortOutcome,
    ) -> Result<WashSession, ControllerError> {
        let session = self.load_session(session_id)?;
        if session.status != SessionStatus::Active {
            return Err(ControllerError::SessionClosed(session.status));
        }

        let now = self.clock.now();
        let affected = self.store.close_session(
            session_id,
            session.step,
            outcome.status(),
            StopReason::HardwareFailure,
            now,
        )?;
        if affected == 0 {
            let current = self.load_session(session_id)?;
            return Err(ControllerError::SessionClosed(current.status));
        }

        if session.step == SessionStep::Timer {
            self.update_occupancy(&session.station_id, Occupancy::Released(now));
        }

        record_log_event(
            &self.store,
            now,
            LogEventDraft {
                level: "warn",
                code: "controller.abort",
                message: format!("session closed as {}", outcome.status()),
                source: LOG_SOURCE,
                station_id: Some(&session.station_id),
                session_id: Some(session_id),
                details: Some(json!({ "step": session.step.as_str() })),
            },
        );
        tracing::warn!(session_id, status = %outcome.status(), "wash session aborted");

        self.load_session(session_id)
    }

    pub fn session(&self, session_id: &str) -> Result<WashSession, ControllerError> {
        self.load_session(session_id)
    }

    fn load_session(&self, session_id: &str) -> Result<WashSession, ControllerError> {
        self.store
            .get_session(session_id)?
            .ok_or_else(|| ControllerError::SessionNotFound(session_id.to_string()))
    }

    fn load_station(&self, station_id: &str) -> Result<Station, ControllerError> {
        self.store
            .get_station(station_id)?
            .ok_or_else(|| ControllerError::StationNotFound(station_id.to_string()))
    }

    fn phase_end(&self, step: SessionStep, now: TimestampMs) -> Option<TimestampMs> {
        self.phases
            .for_step(step)
            .map(|seconds| now.plus_seconds(seconds))
    }

    fn send_command(
        &self,
        station_id: &str,
        command: &StationCommand,
    ) -> Result<(), TransportError> {
        let topic = self.topics.command_topic(station_id);
        with_connection(&self.connector, |connection| {
            connection.publish(&topic, command.to_payload(), DeliveryQos::AtLeastOnce, false)
        })
    }

    fn record_hardware_failure(&self, session: &WashSession, code: &str, error: &TransportError) {
        tracing::warn!(
            session_id = %session.id,
            station_id = %session.station_id,
            error = %error,
            "station command failed; session left unchanged"
        );
        record_log_event(
            &self.store,
            self.clock.now(),
            LogEventDraft {
                level: "warn",
                code,
                message: error.to_string(),
                source: LOG_SOURCE,
                station_id: Some(&session.station_id),
                session_id: Some(&session.id),
                details: Some(json!({ "step": session.step.as_str() })),
            },
        );
    }

    fn update_occupancy(&self, station_id: &str, occupancy: Occupancy) {
        let result = match occupancy {
            Occupancy::Busy => self.store.mark_station_busy(station_id),
            Occupancy::Released(now) => self.store.release_station(station_id, now),
        };

        if let Err(error) = result {
            tracing::warn!(station_id, error = %error, "failed to update station occupancy");
        }
    }
}

enum Occupancy {
    Busy,
    Released(TimestampMs),
}

/// Timing of a session whose hardware has already been actuated.
fn running_timing(session: &WashSession) -> Option<SessionTiming> {
    match session.step {
        SessionStep::Ready | SessionStep::Rules => None,
        _ => session.timing(),
    }
}

#[cfg(test)]
mod tests {
    use crate::app::services::{SessionQueryHandler, SqliteSessionService};
    use crate::domain::command_payload::TopicLayout;
    use crate::domain::heartbeat::AdmissionError;
    use crate::domain::models::{
        SessionStatus, SessionStep, StationCapabilities, StationStatus, StopReason,
    };
    use crate::domain::session_state::{PhaseDurations, TransitionError};
    use crate::test_support::{
        FixedClock, StubConnector, T0, open_shared_test_connection, seed_station,
        station_with_heartbeat,
    };

    use super::{
        AbortOutcome, ControllerError, CreateSessionRequest, SessionController, StartOutcome,
    };

    type TestController = SessionController<SqliteSessionService, StubConnector, FixedClock>;

    struct Harness {
        controller: TestController,
        store: SqliteSessionService,
        connector: StubConnector,
        clock: FixedClock,
    }

    fn harness(name: &str, capabilities: StationCapabilities) -> Harness {
        let shared = open_shared_test_connection(name);
        {
            let mut connection = shared.lock().expect("lock");
            let mut station = station_with_heartbeat("S1", Some(T0));
            station.capabilities = capabilities;
            seed_station(&mut connection, &station);
        }

        let store = SqliteSessionService::new(shared);
        let connector = StubConnector::new();
        let clock = FixedClock::at(T0);
        let controller = SessionController::new(
            store.clone(),
            connector.clone(),
            clock.clone(),
            TopicLayout::default(),
            PhaseDurations::default(),
        );

        Harness {
            controller,
            store,
            connector,
            clock,
        }
    }

    fn request(option_id: i64) -> CreateSessionRequest {
        CreateSessionRequest {
            station_id: "S1".to_string(),
            option_id,
            user_id: None,
            payment_ref: Some("cs_test_1".to_string()),
        }
    }

    #[test]
    fn creates_ready_session_with_snapshotted_option() {
        let h = harness("ctl-create", StationCapabilities::default());

        let session = h.controller.create_session(&request(2)).expect("create");

        assert_eq!(session.step, SessionStep::Ready);
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.duration_seconds, 300);
        assert_eq!(session.option_name, "Full wash");
        assert_eq!(session.user_id, None);
        assert!(h.connector.published().is_empty());
    }

    #[test]
    fn rejects_unknown_option_and_unknown_station() {
        let h = harness("ctl-unknown", StationCapabilities::default());

        assert!(matches!(
            h.controller.create_session(&request(99)),
            Err(ControllerError::UnknownOption { option_id: 99, .. })
        ));
        assert!(matches!(
            h.controller.admit("S9"),
            Err(ControllerError::Admission(AdmissionError::UnknownStation(_)))
        ));
    }

    #[test]
    fn admission_recomputes_heartbeat_age_despite_available_status() {
        let h = harness("ctl-admission", StationCapabilities::default());
        h.clock.set(T0.plus_seconds(300));

        let result = h.controller.create_session(&request(2));

        assert!(matches!(
            result,
            Err(ControllerError::Admission(AdmissionError::StaleHeartbeat {
                age_seconds: 300
            }))
        ));
        assert_eq!(h.store.count_sessions().expect("count"), 0);
    }

    #[test]
    fn start_persists_timing_after_acknowledged_command() {
        let h = harness("ctl-start", StationCapabilities::default());
        let session = h.controller.create_session(&request(2)).expect("create");

        let outcome = h.controller.start(&session.id).expect("start");

        let timing = match outcome {
            StartOutcome::Started(timing) => timing,
            other => panic!("unexpected outcome {other:?}"),
        };
        assert_eq!(timing.started_at, T0);
        assert_eq!(timing.ends_at, T0.plus_seconds(300));

        let stored = h.controller.session(&session.id).expect("load");
        assert_eq!(stored.step, SessionStep::Timer);
        assert_eq!(stored.ends_at, T0.plus_seconds(300));

        let published = h.connector.published_to("stations/S1/command");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].json()["command"], "START");
        assert_eq!(published[0].json()["duration_minutes"], 5);
        assert!(!published[0].retain);

        let station = h.store.get_station("S1").expect("query").expect("row");
        assert_eq!(station.status, StationStatus::Busy);
        assert_eq!(h.connector.disconnects(), h.connector.connects());
    }

    #[test]
    fn start_failure_leaves_session_ready_and_untouched() {
        let h = harness("ctl-start-timeout", StationCapabilities::default());
        let session = h.controller.create_session(&request(2)).expect("create");
        h.connector.fail_publishes("publish not acknowledged within 5000ms");
        h.clock.set(T0.plus_seconds(20));

        let result = h.controller.start(&session.id);

        assert!(matches!(result, Err(ControllerError::Hardware(_))));
        let stored = h.controller.session(&session.id).expect("load");
        assert_eq!(stored.step, SessionStep::Ready);
        assert_eq!(stored.started_at, None);
        assert_eq!(stored.ends_at, session.ends_at);
        assert_eq!(h.connector.disconnects(), h.connector.connects());

        h.connector.recover();
        let retried = h.controller.start(&session.id).expect("retry");
        assert_eq!(retried.timing().ends_at, T0.plus_seconds(320));
    }

    #[test]
    fn start_reports_broker_outage_as_connect_error() {
        let h = harness("ctl-start-connect", StationCapabilities::default());
        let session = h.controller.create_session(&request(2)).expect("create");
        h.connector.fail_connects("connection refused");

        assert!(matches!(
            h.controller.start(&session.id),
            Err(ControllerError::Connect(_))
        ));
        let stored = h.controller.session(&session.id).expect("load");
        assert_eq!(stored.step, SessionStep::Ready);
    }

    #[test]
    fn duplicate_start_returns_persisted_timing_without_second_command() {
        let h = harness("ctl-start-twice", StationCapabilities::default());
        let session = h.controller.create_session(&request(2)).expect("create");

        let first = h.controller.start(&session.id).expect("first start");
        h.clock.set(T0.plus_seconds(2));
        let second = h.controller.start(&session.id).expect("second start");

        assert_eq!(second, StartOutcome::AlreadyRunning(first.timing()));
        assert_eq!(h.connector.published().len(), 1);
    }

    #[test]
    fn rules_gate_requires_advance_before_start() {
        let caps = StationCapabilities {
            rules_gate: true,
            ..StationCapabilities::default()
        };
        let h = harness("ctl-rules", caps);
        let session = h.controller.create_session(&request(2)).expect("create");

        assert!(matches!(
            h.controller.start(&session.id),
            Err(ControllerError::Transition(TransitionError::RulesPending))
        ));
        assert!(h.connector.published().is_empty());

        h.controller
            .advance(&session.id, SessionStep::Ready, SessionStep::Rules)
            .expect("accept rules");
        let outcome = h.controller.start(&session.id).expect("start");
        assert!(matches!(outcome, StartOutcome::Started(_)));
    }

    #[test]
    fn manual_stop_on_basic_station_completes_session() {
        let h = harness("ctl-stop-basic", StationCapabilities::default());
        let session = h.controller.create_session(&request(2)).expect("create");
        h.controller.start(&session.id).expect("start");
        h.clock.set(T0.plus_seconds(100));

        let outcome = h
            .controller
            .stop(&session.id, StopReason::Manual)
            .expect("stop");

        assert_eq!(outcome.step, SessionStep::Rating);
        assert_eq!(outcome.status, SessionStatus::Completed);
        assert!(outcome.off_sent);
        assert!(outcome.non_refundable);

        let published = h.connector.published_to("stations/S1/command");
        assert_eq!(published.len(), 2);
        assert_eq!(published[1].json()["command"], "OFF");

        let stored = h.controller.session(&session.id).expect("load");
        assert_eq!(stored.stop_reason, Some(StopReason::Manual));
        assert_eq!(stored.ends_at, T0.plus_seconds(300));
        let station = h.store.get_station("S1").expect("query").expect("row");
        assert_eq!(station.status, StationStatus::Available);
    }

    #[test]
    fn auto_stop_moves_into_first_post_run_phase() {
        let caps = StationCapabilities {
            rules_gate: false,
            cleanup: false,
            courtesy: true,
            sanitizing: true,
        };
        let h = harness("ctl-stop-courtesy", caps);
        let session = h.controller.create_session(&request(2)).expect("create");
        h.controller.start(&session.id).expect("start");
        h.clock.set(T0.plus_seconds(300));

        let outcome = h
            .controller
            .stop(&session.id, StopReason::Auto)
            .expect("stop");

        assert_eq!(outcome.step, SessionStep::Courtesy);
        assert_eq!(outcome.status, SessionStatus::Active);
        assert!(!outcome.non_refundable);

        let stored = h.controller.session(&session.id).expect("load");
        assert_eq!(stored.phase_ends_at, Some(T0.plus_seconds(360)));
        assert_eq!(stored.ends_at, T0.plus_seconds(300));

        let advanced = h
            .controller
            .advance(&session.id, SessionStep::Courtesy, SessionStep::Sanitizing)
            .expect("advance");
        assert_eq!(advanced.phase_ends_at, Some(T0.plus_seconds(390)));

        let rated = h
            .controller
            .advance(&session.id, SessionStep::Sanitizing, SessionStep::Rating)
            .expect("advance");
        assert_eq!(rated.status, SessionStatus::Completed);

        let again = h
            .controller
            .stop(&session.id, StopReason::Auto)
            .expect("stop on closed session");
        assert!(!again.off_sent);
        assert_eq!(h.connector.published().len(), 2);
    }

    #[test]
    fn stop_hardware_failure_keeps_timer_running() {
        let h = harness("ctl-stop-fail", StationCapabilities::default());
        let session = h.controller.create_session(&request(2)).expect("create");
        h.controller.start(&session.id).expect("start");
        h.connector.fail_publishes("timeout");

        assert!(matches!(
            h.controller.stop(&session.id, StopReason::Manual),
            Err(ControllerError::Hardware(_))
        ));
        let stored = h.controller.session(&session.id).expect("load");
        assert_eq!(stored.step, SessionStep::Timer);
        assert_eq!(stored.status, SessionStatus::Active);
        assert_eq!(h.store.count_log_events().expect("count"), 1);
    }

    #[test]
    fn stop_before_start_is_rejected() {
        let h = harness("ctl-stop-ready", StationCapabilities::default());
        let session = h.controller.create_session(&request(2)).expect("create");

        assert!(matches!(
            h.controller.stop(&session.id, StopReason::Manual),
            Err(ControllerError::Transition(_))
        ));
        assert!(h.connector.published().is_empty());
    }

    #[test]
    fn advance_with_stale_from_step_is_a_conflict() {
        let caps = StationCapabilities {
            rules_gate: true,
            ..StationCapabilities::default()
        };
        let h = harness("ctl-advance-conflict", caps);
        let session = h.controller.create_session(&request(2)).expect("create");
        h.controller
            .advance(&session.id, SessionStep::Ready, SessionStep::Rules)
            .expect("advance");

        assert!(matches!(
            h.controller
                .advance(&session.id, SessionStep::Ready, SessionStep::Rules),
            Err(ControllerError::Conflict {
                expected: SessionStep::Ready,
                ..
            })
        ));
    }

    #[test]
    fn abort_closes_session_terminally() {
        let h = harness("ctl-abort", StationCapabilities::default());
        let session = h.controller.create_session(&request(2)).expect("create");

        let closed = h
            .controller
            .abort(&session.id, AbortOutcome::Cancelled)
            .expect("abort");

        assert_eq!(closed.status, SessionStatus::Cancelled);
        assert_eq!(closed.stop_reason, Some(StopReason::HardwareFailure));
        assert!(matches!(
            h.controller.start(&session.id),
            Err(ControllerError::SessionClosed(SessionStatus::Cancelled))
        ));
        assert!(matches!(
            h.controller.abort(&session.id, AbortOutcome::Expired),
            Err(ControllerError::SessionClosed(SessionStatus::Cancelled))
        ));
    }
}
