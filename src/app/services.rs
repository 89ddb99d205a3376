use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use thiserror::Error;

use crate::adapters::db;
use crate::adapters::db::{DbError, StepUpdate};
use crate::domain::models::{
    LogEventRecord, NewLogEventRecord, NewWashSession, SessionStatus, SessionStep, Station,
    StopReason, WashSession,
};
use crate::domain::session_state::TimestampMs;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("database lock poisoned")]
    DbLockPoisoned,
    #[error("database operation failed: {0}")]
    Database(#[from] DbError),
}

pub trait SessionQueryHandler {
    fn get_session(&self, session_id: &str) -> Result<Option<WashSession>, ServiceError>;
    fn get_station(&self, station_id: &str) -> Result<Option<Station>, ServiceError>;
    fn list_expired_running_sessions(
        &self,
        now: TimestampMs,
    ) -> Result<Vec<WashSession>, ServiceError>;
    fn list_lapsed_post_run_sessions(
        &self,
        now: TimestampMs,
    ) -> Result<Vec<WashSession>, ServiceError>;
    fn has_superseding_session(
        &self,
        station_id: &str,
        excluded_session_id: &str,
        now: TimestampMs,
    ) -> Result<bool, ServiceError>;
    fn get_schema_version(&self) -> Result<u32, ServiceError>;
    fn count_sessions(&self) -> Result<i64, ServiceError>;
    fn count_active_sessions(&self) -> Result<i64, ServiceError>;
    fn count_log_events(&self) -> Result<i64, ServiceError>;
    fn list_recent_log_events(&self, limit: u32) -> Result<Vec<LogEventRecord>, ServiceError>;
}

/// Every mutation returns the number of affected rows; 0 means a concurrent
/// writer got there first.
pub trait SessionCommandHandler {
    fn insert_session(&self, new_session: &NewWashSession) -> Result<String, ServiceError>;
    fn mark_session_started(
        &self,
        session_id: &str,
        started_at: TimestampMs,
        ends_at: TimestampMs,
    ) -> Result<usize, ServiceError>;
    fn update_session_step(
        &self,
        session_id: &str,
        update: &StepUpdate,
        now: TimestampMs,
    ) -> Result<usize, ServiceError>;
    fn close_session(
        &self,
        session_id: &str,
        step: SessionStep,
        status: SessionStatus,
        stop_reason: StopReason,
        now: TimestampMs,
    ) -> Result<usize, ServiceError>;
    fn touch_station_heartbeat(
        &self,
        station_id: &str,
        seen_at: TimestampMs,
    ) -> Result<usize, ServiceError>;
    fn mark_station_offline(&self, station_id: &str) -> Result<usize, ServiceError>;
    fn mark_stale_stations_offline(&self, stale_before: TimestampMs)
    -> Result<usize, ServiceError>;
    fn mark_station_busy(&self, station_id: &str) -> Result<usize, ServiceError>;
    fn release_station(&self, station_id: &str, now: TimestampMs) -> Result<usize, ServiceError>;
    fn insert_log_event(&self, new_log_event: &NewLogEventRecord) -> Result<String, ServiceError>;
}

#[derive(Clone)]
pub struct SqliteSessionService {
    connection: Arc<Mutex<Connection>>,
}

impl SqliteSessionService {
    pub fn new(connection: Arc<Mutex<Connection>>) -> Self {
        Self { connection }
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, DbError>,
    ) -> Result<T, ServiceError> {
        let connection = self
            .connection
            .lock()
            .map_err(|_| ServiceError::DbLockPoisoned)?;
        op(&connection).map_err(ServiceError::from)
    }
}

impl SessionQueryHandler for SqliteSessionService {
    fn get_session(&self, session_id: &str) -> Result<Option<WashSession>, ServiceError> {
        self.with_connection(|connection| db::get_session(connection, session_id))
    }

    fn get_station(&self, station_id: &str) -> Result<Option<Station>, ServiceError> {
        self.with_connection(|connection| db::get_station(connection, station_id))
    }

    fn list_expired_running_sessions(
        &self,
        now: TimestampMs,
    ) -> Result<Vec<WashSession>, ServiceError> {
        self.with_connection(|connection| db::list_expired_running_sessions(connection, now))
    }

    fn list_lapsed_post_run_sessions(
        &self,
        now: TimestampMs,
    ) -> Result<Vec<WashSession>, ServiceError> {
        self.with_connection(|connection| db::list_lapsed_post_run_sessions(connection, now))
    }

    fn has_superseding_session(
        &self,
        station_id: &str,
        excluded_session_id: &str,
        now: TimestampMs,
    ) -> Result<bool, ServiceError> {
        self.with_connection(|connection| {
            db::has_superseding_session(connection, station_id, excluded_session_id, now)
        })
    }

    fn get_schema_version(&self) -> Result<u32, ServiceError> {
        self.with_connection(db::schema_version)
    }

    fn count_sessions(&self) -> Result<i64, ServiceError> {
        self.with_connection(db::count_sessions)
    }

    fn count_active_sessions(&self) -> Result<i64, ServiceError> {
        self.with_connection(db::count_active_sessions)
    }

    fn count_log_events(&self) -> Result<i64, ServiceError> {
        self.with_connection(db::count_log_events)
    }

    fn list_recent_log_events(&self, limit: u32) -> Result<Vec<LogEventRecord>, ServiceError> {
        self.with_connection(|connection| db::list_recent_log_events(connection, limit))
    }
}

impl SessionCommandHandler for SqliteSessionService {
    fn insert_session(&self, new_session: &NewWashSession) -> Result<String, ServiceError> {
        self.with_connection(|connection| db::insert_session(connection, new_session))
    }

    fn mark_session_started(
        &self,
        session_id: &str,
        started_at: TimestampMs,
        ends_at: TimestampMs,
    ) -> Result<usize, ServiceError> {
        self.with_connection(|connection| {
            db::mark_session_started(connection, session_id, started_at, ends_at)
        })
    }

    fn update_session_step(
        &self,
        session_id: &str,
        update: &StepUpdate,
        now: TimestampMs,
    ) -> Result<usize, ServiceError> {
        self.with_connection(|connection| {
            db::update_session_step(connection, session_id, update, now)
        })
    }

    fn close_session(
        &self,
        session_id: &str,
        step: SessionStep,
        status: SessionStatus,
        stop_reason: StopReason,
        now: TimestampMs,
    ) -> Result<usize, ServiceError> {
        self.with_connection(|connection| {
            db::close_session(connection, session_id, step, status, stop_reason, now)
        })
    }

    fn touch_station_heartbeat(
        &self,
        station_id: &str,
        seen_at: TimestampMs,
    ) -> Result<usize, ServiceError> {
        self.with_connection(|connection| {
            db::touch_station_heartbeat(connection, station_id, seen_at)
        })
    }

    fn mark_station_offline(&self, station_id: &str) -> Result<usize, ServiceError> {
        self.with_connection(|connection| db::mark_station_offline(connection, station_id))
    }

    fn mark_stale_stations_offline(
        &self,
        stale_before: TimestampMs,
    ) -> Result<usize, ServiceError> {
        self.with_connection(|connection| {
            db::mark_stale_stations_offline(connection, stale_before)
        })
    }

    fn mark_station_busy(&self, station_id: &str) -> Result<usize, ServiceError> {
        self.with_connection(|connection| db::mark_station_busy(connection, station_id))
    }

    fn release_station(&self, station_id: &str, now: TimestampMs) -> Result<usize, ServiceError> {
        self.with_connection(|connection| db::release_station(connection, station_id, now))
    }

    fn insert_log_event(&self, new_log_event: &NewLogEventRecord) -> Result<String, ServiceError> {
        self.with_connection(|connection| db::insert_log_event(connection, new_log_event))
    }
}

pub struct LogEventDraft<'a> {
    pub level: &'a str,
    pub code: &'a str,
    pub message: String,
    pub source: &'a str,
    pub station_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
    pub details: Option<serde_json::Value>,
}

/// Appends to the diagnostics log. The log is secondary to the session row,
/// so a failed write is traced and otherwise ignored.
pub fn record_log_event<S: SessionCommandHandler>(
    store: &S,
    at: TimestampMs,
    draft: LogEventDraft<'_>,
) {
    let record = NewLogEventRecord {
        created_at: at.to_rfc3339(),
        level: draft.level.to_string(),
        code: draft.code.to_string(),
        message: draft.message,
        source: draft.source.to_string(),
        station_id: draft.station_id.map(ToString::to_string),
        session_id: draft.session_id.map(ToString::to_string),
        details_json: draft.details.map(|details| details.to_string()),
    };

    if let Err(error) = store.insert_log_event(&record) {
        tracing::warn!(error = %error, code = %record.code, "failed to persist log event");
    }
}
