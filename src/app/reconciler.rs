use serde::Serialize;
use serde_json::json;

use crate::adapters::db::StepUpdate;
use crate::adapters::mqtt::{Connector, DeliveryQos, Transport, TransportError};
use crate::app::services::{
    LogEventDraft, ServiceError, SessionCommandHandler, SessionQueryHandler, record_log_event,
};
use crate::domain::command_payload::{StationCommand, TopicLayout};
use crate::domain::models::{SessionStatus, SessionStep, StopReason, WashSession};
use crate::domain::session_state::{Clock, TimestampMs};

const LOG_SOURCE: &str = "reconciler";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub examined: usize,
    pub closed: usize,
    pub off_sent: usize,
    pub off_failed: usize,
    pub superseded_skips: usize,
    pub already_closed: usize,
    pub phases_closed: usize,
    pub errors: usize,
}

/// Lazily opened, shared by every OFF in one invocation. A failed connect is
/// remembered so the broker is not hammered once per row.
enum Link<T> {
    Idle,
    Open(T),
    Unreachable,
}

/// Closes sessions whose paid time ran out while no client was watching.
pub struct ExpiryReconciler<S, C, K> {
    store: S,
    connector: C,
    clock: K,
    topics: TopicLayout,
}

impl<S, C, K> ExpiryReconciler<S, C, K>
where
    S: SessionQueryHandler + SessionCommandHandler,
    C: Connector,
    K: Clock,
{
    pub fn new(store: S, connector: C, clock: K, topics: TopicLayout) -> Self {
        Self {
            store,
            connector,
            clock,
            topics,
        }
    }

    pub fn run_once(&self) -> Result<ReconcileReport, ServiceError> {
        let now = self.clock.now();
        let expired = self.store.list_expired_running_sessions(now)?;
        let mut report = ReconcileReport {
            examined: expired.len(),
            ..ReconcileReport::default()
        };
        let mut link = Link::Idle;

        for session in &expired {
            if let Err(error) = self.reconcile_session(session, now, &mut link, &mut report) {
                report.errors += 1;
                tracing::warn!(
                    session_id = %session.id,
                    error = %error,
                    "failed to reconcile expired session"
                );
            }
        }

        if let Link::Open(mut connection) = link {
            connection.disconnect();
        }

        self.close_lapsed_phases(now, &mut report)?;

        tracing::info!(
            examined = report.examined,
            closed = report.closed,
            off_sent = report.off_sent,
            off_failed = report.off_failed,
            superseded_skips = report.superseded_skips,
            already_closed = report.already_closed,
            phases_closed = report.phases_closed,
            errors = report.errors,
            "reconcile pass finished"
        );

        Ok(report)
    }

    fn reconcile_session(
        &self,
        session: &WashSession,
        now: TimestampMs,
        link: &mut Link<C::Connection>,
        report: &mut ReconcileReport,
    ) -> Result<(), ServiceError> {
        let superseded = self
            .store
            .has_superseding_session(&session.station_id, &session.id, now)?;

        if superseded {
            report.superseded_skips += 1;
            tracing::info!(
                session_id = %session.id,
                station_id = %session.station_id,
                "newer session holds the station; skipping OFF"
            );
            self.log(
                "info",
                "reconciler.superseded_skip",
                "OFF skipped, station held by a newer session".to_string(),
                session,
                now,
            );
        } else {
            match self.send_off(&session.station_id, now, link) {
                Ok(()) => {
                    report.off_sent += 1;
                    tracing::info!(
                        session_id = %session.id,
                        station_id = %session.station_id,
                        "OFF sent for expired session"
                    );
                }
                Err(error) => {
                    report.off_failed += 1;
                    tracing::warn!(
                        session_id = %session.id,
                        station_id = %session.station_id,
                        error = %error,
                        "OFF failed for expired session; closing row anyway"
                    );
                    self.log(
                        "warn",
                        "reconciler.off_failed",
                        error.to_string(),
                        session,
                        now,
                    );
                }
            }
        }

        let affected = self.store.close_session(
            &session.id,
            SessionStep::Rating,
            SessionStatus::Completed,
            StopReason::Expired,
            now,
        )?;

        if affected == 0 {
            report.already_closed += 1;
            tracing::debug!(session_id = %session.id, "session already closed by another writer");
            return Ok(());
        }
        report.closed += 1;

        // Stays busy while another session holds the timer.
        if let Err(error) = self.store.release_station(&session.station_id, now) {
            tracing::warn!(
                station_id = %session.station_id,
                error = %error,
                "failed to release station after expiry"
            );
        }

        Ok(())
    }

    fn send_off(
        &self,
        station_id: &str,
        now: TimestampMs,
        link: &mut Link<C::Connection>,
    ) -> Result<(), TransportError> {
        if matches!(link, Link::Idle) {
            match self.connector.connect() {
                Ok(connection) => *link = Link::Open(connection),
                Err(error) => {
                    tracing::warn!(error = %error, "broker unreachable during reconcile pass");
                    *link = Link::Unreachable;
                    return Err(error);
                }
            }
        }

        match link {
            Link::Open(connection) => connection.publish(
                &self.topics.command_topic(station_id),
                StationCommand::off(now).to_payload(),
                DeliveryQos::AtLeastOnce,
                false,
            ),
            _ => Err(TransportError::Connect(
                "broker unreachable earlier in this pass".to_string(),
            )),
        }
    }

    fn close_lapsed_phases(
        &self,
        now: TimestampMs,
        report: &mut ReconcileReport,
    ) -> Result<(), ServiceError> {
        for session in self.store.list_lapsed_post_run_sessions(now)? {
            let affected = self.store.update_session_step(
                &session.id,
                &StepUpdate {
                    from: session.step,
                    to: SessionStep::Rating,
                    phase_ends_at: None,
                    status: SessionStatus::Completed,
                    stop_reason: None,
                },
                now,
            )?;

            if affected > 0 {
                report.phases_closed += 1;
                tracing::info!(
                    session_id = %session.id,
                    step = %session.step,
                    "lapsed post-run phase closed"
                );
            }
        }

        Ok(())
    }

    fn log(
        &self,
        level: &str,
        code: &str,
        message: String,
        session: &WashSession,
        now: TimestampMs,
    ) {
        record_log_event(
            &self.store,
            now,
            LogEventDraft {
                level,
                code,
                message,
                source: LOG_SOURCE,
                station_id: Some(&session.station_id),
                session_id: Some(&session.id),
                details: Some(json!({ "endsAt": session.ends_at.to_rfc3339() })),
            },
        );
    }
}
