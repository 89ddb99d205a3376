use std::time::Duration;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

use crate::domain::models::{
    LogEventRecord, NewLogEventRecord, NewWashSession, ServiceOption, SessionStatus, SessionStep,
    Station, StationCapabilities, StationStatus, StopReason, WashSession,
};
use crate::domain::session_state::TimestampMs;

pub const LATEST_SCHEMA_VERSION: u32 = 2;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const MIGRATIONS: &[(u32, &str)] = &[
    (
        1,
        r#"
CREATE TABLE IF NOT EXISTS stations (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'OFFLINE'
        CHECK (status IN ('AVAILABLE', 'BUSY', 'OFFLINE', 'MAINTENANCE')),
    last_heartbeat_at TEXT,
    rules_gate INTEGER NOT NULL DEFAULT 0,
    cleanup INTEGER NOT NULL DEFAULT 0,
    courtesy INTEGER NOT NULL DEFAULT 0,
    sanitizing INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS station_options (
    station_id TEXT NOT NULL REFERENCES stations (id),
    option_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    price_cents INTEGER NOT NULL,
    duration_seconds INTEGER NOT NULL CHECK (duration_seconds > 0),
    PRIMARY KEY (station_id, option_id)
);

CREATE TABLE IF NOT EXISTS wash_sessions (
    id TEXT PRIMARY KEY,
    station_id TEXT NOT NULL REFERENCES stations (id),
    user_id TEXT,
    option_id INTEGER NOT NULL,
    option_name TEXT NOT NULL,
    duration_seconds INTEGER NOT NULL,
    started_at TEXT,
    ends_at TEXT NOT NULL,
    step TEXT NOT NULL,
    phase_ends_at TEXT,
    status TEXT NOT NULL
        CHECK (status IN ('ACTIVE', 'COMPLETED', 'EXPIRED', 'CANCELLED')),
    stop_reason TEXT,
    payment_ref TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_wash_sessions_status_ends_at
ON wash_sessions (status, ends_at);

CREATE INDEX IF NOT EXISTS idx_wash_sessions_station_status
ON wash_sessions (station_id, status, ends_at);
"#,
    ),
    (
        2,
        r#"
CREATE TABLE IF NOT EXISTS log_events (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    level TEXT NOT NULL,
    code TEXT NOT NULL,
    message TEXT NOT NULL,
    source TEXT NOT NULL,
    station_id TEXT,
    session_id TEXT,
    details_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_log_events_created_at_desc
ON log_events (created_at DESC);
"#,
    ),
];

const SESSION_COLUMNS: &str = "id, station_id, user_id, option_id, option_name, duration_seconds,
    started_at, ends_at, step, phase_ends_at, status, stop_reason, payment_ref,
    created_at, updated_at";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {current}; latest supported is {latest}")]
    UnsupportedSchemaVersion { current: u32, latest: u32 },
}

#[derive(Debug, Error)]
#[error("unexpected value {value:?} in column {column}")]
struct InvalidColumn {
    column: &'static str,
    value: String,
}

pub fn open_connection(path: &str) -> Result<Connection, DbError> {
    let connection = Connection::open(path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.pragma_update(None, "foreign_keys", true)?;
    Ok(connection)
}

pub fn run_migrations(connection: &mut Connection) -> Result<(), DbError> {
    let current_version = schema_version(connection)?;

    if current_version > LATEST_SCHEMA_VERSION {
        return Err(DbError::UnsupportedSchemaVersion {
            current: current_version,
            latest: LATEST_SCHEMA_VERSION,
        });
    }

    let transaction = connection.transaction()?;

    for (version, sql) in MIGRATIONS {
        if *version > current_version {
            transaction.execute_batch(sql)?;
            transaction.pragma_update(None, "user_version", version)?;
        }
    }

    transaction.commit()?;

    Ok(())
}

pub fn schema_version(connection: &Connection) -> Result<u32, DbError> {
    let version = connection.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Writes a station and replaces its catalog. Stations are configured out of
/// band; this is the seeding path for tooling and tests.
pub fn upsert_station(connection: &mut Connection, station: &Station) -> Result<(), DbError> {
    let transaction = connection.transaction()?;

    transaction.execute(
        "INSERT INTO stations (id, status, last_heartbeat_at, rules_gate, cleanup, courtesy, sanitizing)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (id) DO UPDATE SET
            status = excluded.status,
            last_heartbeat_at = excluded.last_heartbeat_at,
            rules_gate = excluded.rules_gate,
            cleanup = excluded.cleanup,
            courtesy = excluded.courtesy,
            sanitizing = excluded.sanitizing",
        params![
            station.id,
            station.status.as_str(),
            station.last_heartbeat_at.map(TimestampMs::to_rfc3339),
            station.capabilities.rules_gate,
            station.capabilities.cleanup,
            station.capabilities.courtesy,
            station.capabilities.sanitizing,
        ],
    )?;

    transaction.execute(
        "DELETE FROM station_options WHERE station_id = ?1",
        params![station.id],
    )?;

    for option in &station.options {
        transaction.execute(
            "INSERT INTO station_options (station_id, option_id, name, price_cents, duration_seconds)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                station.id,
                option.option_id,
                option.name,
                option.price_cents,
                option.duration_seconds,
            ],
        )?;
    }

    transaction.commit()?;
    Ok(())
}

pub fn get_station(connection: &Connection, station_id: &str) -> Result<Option<Station>, DbError> {
    let station = connection
        .query_row(
            "SELECT id, status, last_heartbeat_at, rules_gate, cleanup, courtesy, sanitizing
             FROM stations
             WHERE id = ?1",
            params![station_id],
            |row| {
                Ok(Station {
                    id: row.get(0)?,
                    status: parse_column(row, 1, "status", StationStatus::parse)?,
                    last_heartbeat_at: parse_optional_timestamp(row, 2, "last_heartbeat_at")?,
                    capabilities: StationCapabilities {
                        rules_gate: row.get(3)?,
                        cleanup: row.get(4)?,
                        courtesy: row.get(5)?,
                        sanitizing: row.get(6)?,
                    },
                    options: Vec::new(),
                })
            },
        )
        .optional()?;

    let Some(mut station) = station else {
        return Ok(None);
    };

    let mut statement = connection.prepare(
        "SELECT option_id, name, price_cents, duration_seconds
         FROM station_options
         WHERE station_id = ?1
         ORDER BY option_id",
    )?;
    let rows = statement.query_map(params![station_id], |row| {
        Ok(ServiceOption {
            option_id: row.get(0)?,
            name: row.get(1)?,
            price_cents: row.get(2)?,
            duration_seconds: row.get(3)?,
        })
    })?;

    for row in rows {
        station.options.push(row?);
    }

    Ok(Some(station))
}

pub fn insert_session(
    connection: &Connection,
    new_session: &NewWashSession,
) -> Result<String, DbError> {
    let id = uuid::Uuid::new_v4().to_string();
    let created_at = new_session.created_at.to_rfc3339();

    connection.execute(
        "INSERT INTO wash_sessions (
            id, station_id, user_id, option_id, option_name, duration_seconds,
            started_at, ends_at, step, phase_ends_at, status, stop_reason, payment_ref,
            created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, 'ready', NULL, 'ACTIVE', NULL, ?8, ?9, ?9)",
        params![
            id,
            new_session.station_id,
            new_session.user_id,
            new_session.option_id,
            new_session.option_name,
            new_session.duration_seconds,
            new_session.placeholder_ends_at.to_rfc3339(),
            new_session.payment_ref,
            created_at,
        ],
    )?;

    Ok(id)
}

pub fn get_session(
    connection: &Connection,
    session_id: &str,
) -> Result<Option<WashSession>, DbError> {
    let session = connection
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM wash_sessions WHERE id = ?1"),
            params![session_id],
            map_session,
        )
        .optional()?;
    Ok(session)
}

/// Persists confirmed actuation. Only a session still waiting to start is
/// touched, so a concurrent starter or closer turns this into a 0-row update.
pub fn mark_session_started(
    connection: &Connection,
    session_id: &str,
    started_at: TimestampMs,
    ends_at: TimestampMs,
) -> Result<usize, DbError> {
    let affected = connection.execute(
        "UPDATE wash_sessions
         SET started_at = ?2, ends_at = ?3, step = 'timer', updated_at = ?2
         WHERE id = ?1 AND status = 'ACTIVE' AND step IN ('ready', 'rules')",
        params![session_id, started_at.to_rfc3339(), ends_at.to_rfc3339()],
    )?;
    Ok(affected)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepUpdate {
    pub from: SessionStep,
    pub to: SessionStep,
    pub phase_ends_at: Option<TimestampMs>,
    pub status: SessionStatus,
    pub stop_reason: Option<StopReason>,
}

/// Compare-and-swap on `step`; `stop_reason` is only ever filled in, never
/// cleared.
pub fn update_session_step(
    connection: &Connection,
    session_id: &str,
    update: &StepUpdate,
    now: TimestampMs,
) -> Result<usize, DbError> {
    let affected = connection.execute(
        "UPDATE wash_sessions
         SET step = ?3, phase_ends_at = ?4, status = ?5,
             stop_reason = COALESCE(?6, stop_reason), updated_at = ?7
         WHERE id = ?1 AND step = ?2 AND status = 'ACTIVE'",
        params![
            session_id,
            update.from.as_str(),
            update.to.as_str(),
            update.phase_ends_at.map(TimestampMs::to_rfc3339),
            update.status.as_str(),
            update.stop_reason.map(StopReason::as_str),
            now.to_rfc3339(),
        ],
    )?;
    Ok(affected)
}

/// Terminal close predicated only on the row still being active.
pub fn close_session(
    connection: &Connection,
    session_id: &str,
    step: SessionStep,
    status: SessionStatus,
    stop_reason: StopReason,
    now: TimestampMs,
) -> Result<usize, DbError> {
    let affected = connection.execute(
        "UPDATE wash_sessions
         SET step = ?2, status = ?3, stop_reason = ?4, phase_ends_at = NULL, updated_at = ?5
         WHERE id = ?1 AND status = 'ACTIVE'",
        params![
            session_id,
            step.as_str(),
            status.as_str(),
            stop_reason.as_str(),
            now.to_rfc3339(),
        ],
    )?;
    Ok(affected)
}

pub fn list_expired_running_sessions(
    connection: &Connection,
    now: TimestampMs,
) -> Result<Vec<WashSession>, DbError> {
    query_sessions(
        connection,
        &format!(
            "SELECT {SESSION_COLUMNS}
             FROM wash_sessions
             WHERE status = 'ACTIVE' AND step = 'timer' AND ends_at < ?1
             ORDER BY ends_at, id"
        ),
        now,
    )
}

pub fn list_lapsed_post_run_sessions(
    connection: &Connection,
    now: TimestampMs,
) -> Result<Vec<WashSession>, DbError> {
    query_sessions(
        connection,
        &format!(
            "SELECT {SESSION_COLUMNS}
             FROM wash_sessions
             WHERE status = 'ACTIVE'
               AND step IN ('cleanup', 'courtesy', 'sanitizing')
               AND phase_ends_at IS NOT NULL
               AND phase_ends_at < ?1
             ORDER BY phase_ends_at, id"
        ),
        now,
    )
}

/// Whether another session currently holds the station's timer. Rows still
/// in `ready` or `rules` never armed the hardware and do not count.
pub fn has_superseding_session(
    connection: &Connection,
    station_id: &str,
    excluded_session_id: &str,
    now: TimestampMs,
) -> Result<bool, DbError> {
    let exists: bool = connection.query_row(
        "SELECT EXISTS (
            SELECT 1 FROM wash_sessions
            WHERE station_id = ?1 AND id <> ?2 AND status = 'ACTIVE'
              AND step = 'timer' AND ends_at > ?3
         )",
        params![station_id, excluded_session_id, now.to_rfc3339()],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Records a heartbeat without moving `last_heartbeat_at` backwards. An
/// offline station comes back as busy when a session still holds its timer.
pub fn touch_station_heartbeat(
    connection: &Connection,
    station_id: &str,
    seen_at: TimestampMs,
) -> Result<usize, DbError> {
    let affected = connection.execute(
        "UPDATE stations
         SET last_heartbeat_at = CASE
                WHEN last_heartbeat_at IS NULL OR last_heartbeat_at < ?2 THEN ?2
                ELSE last_heartbeat_at
             END,
             status = CASE
                WHEN status <> 'OFFLINE' THEN status
                WHEN EXISTS (
                    SELECT 1 FROM wash_sessions
                    WHERE station_id = ?1 AND status = 'ACTIVE' AND step = 'timer' AND ends_at > ?2
                ) THEN 'BUSY'
                ELSE 'AVAILABLE'
             END
         WHERE id = ?1",
        params![station_id, seen_at.to_rfc3339()],
    )?;
    Ok(affected)
}

pub fn mark_station_offline(connection: &Connection, station_id: &str) -> Result<usize, DbError> {
    let affected = connection.execute(
        "UPDATE stations SET status = 'OFFLINE'
         WHERE id = ?1 AND status IN ('AVAILABLE', 'BUSY')",
        params![station_id],
    )?;
    Ok(affected)
}

pub fn mark_stale_stations_offline(
    connection: &Connection,
    stale_before: TimestampMs,
) -> Result<usize, DbError> {
    let affected = connection.execute(
        "UPDATE stations SET status = 'OFFLINE'
         WHERE status IN ('AVAILABLE', 'BUSY')
           AND (last_heartbeat_at IS NULL OR last_heartbeat_at < ?1)",
        params![stale_before.to_rfc3339()],
    )?;
    Ok(affected)
}

pub fn mark_station_busy(connection: &Connection, station_id: &str) -> Result<usize, DbError> {
    let affected = connection.execute(
        "UPDATE stations SET status = 'BUSY' WHERE id = ?1 AND status = 'AVAILABLE'",
        params![station_id],
    )?;
    Ok(affected)
}

/// Frees a busy station unless another session still holds its timer.
pub fn release_station(
    connection: &Connection,
    station_id: &str,
    now: TimestampMs,
) -> Result<usize, DbError> {
    let affected = connection.execute(
        "UPDATE stations SET status = 'AVAILABLE'
         WHERE id = ?1 AND status = 'BUSY'
           AND NOT EXISTS (
                SELECT 1 FROM wash_sessions
                WHERE station_id = ?1 AND status = 'ACTIVE' AND step = 'timer' AND ends_at > ?2
           )",
        params![station_id, now.to_rfc3339()],
    )?;
    Ok(affected)
}

pub fn count_sessions(connection: &Connection) -> Result<i64, DbError> {
    let count = connection.query_row("SELECT COUNT(*) FROM wash_sessions", [], |row| row.get(0))?;
    Ok(count)
}

pub fn count_active_sessions(connection: &Connection) -> Result<i64, DbError> {
    let count = connection.query_row(
        "SELECT COUNT(*) FROM wash_sessions WHERE status = 'ACTIVE'",
        [],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn count_log_events(connection: &Connection) -> Result<i64, DbError> {
    let count = connection.query_row("SELECT COUNT(*) FROM log_events", [], |row| row.get(0))?;
    Ok(count)
}

pub fn insert_log_event(
    connection: &Connection,
    new_log_event: &NewLogEventRecord,
) -> Result<String, DbError> {
    let id = uuid::Uuid::new_v4().to_string();

    connection.execute(
        "INSERT INTO log_events (id, created_at, level, code, message, source, station_id, session_id, details_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            new_log_event.created_at,
            new_log_event.level,
            new_log_event.code,
            new_log_event.message,
            new_log_event.source,
            new_log_event.station_id,
            new_log_event.session_id,
            new_log_event.details_json,
        ],
    )?;

    Ok(id)
}

pub fn list_recent_log_events(
    connection: &Connection,
    limit: u32,
) -> Result<Vec<LogEventRecord>, DbError> {
    let mut statement = connection.prepare(
        "SELECT id, created_at, level, code, message, source, station_id, session_id, details_json
         FROM log_events
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?1",
    )?;

    let rows = statement.query_map(params![i64::from(limit)], |row| {
        Ok(LogEventRecord {
            id: row.get(0)?,
            created_at: row.get(1)?,
            level: row.get(2)?,
            code: row.get(3)?,
            message: row.get(4)?,
            source: row.get(5)?,
            station_id: row.get(6)?,
            session_id: row.get(7)?,
            details_json: row.get(8)?,
        })
    })?;

    let mut events = Vec::new();
    for row in rows {
        events.push(row?);
    }

    Ok(events)
}

fn query_sessions(
    connection: &Connection,
    sql: &str,
    now: TimestampMs,
) -> Result<Vec<WashSession>, DbError> {
    let mut statement = connection.prepare(sql)?;
    let rows = statement.query_map(params![now.to_rfc3339()], map_session)?;

    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(row?);
    }

    Ok(sessions)
}

fn map_session(row: &Row<'_>) -> rusqlite::Result<WashSession> {
    Ok(WashSession {
        id: row.get(0)?,
        station_id: row.get(1)?,
        user_id: row.get(2)?,
        option_id: row.get(3)?,
        option_name: row.get(4)?,
        duration_seconds: row.get(5)?,
        started_at: parse_optional_timestamp(row, 6, "started_at")?,
        ends_at: parse_column(row, 7, "ends_at", TimestampMs::parse_rfc3339)?,
        step: parse_column(row, 8, "step", SessionStep::parse)?,
        phase_ends_at: parse_optional_timestamp(row, 9, "phase_ends_at")?,
        status: parse_column(row, 10, "status", SessionStatus::parse)?,
        stop_reason: row
            .get::<_, Option<String>>(11)?
            .map(|value| {
                StopReason::parse(&value).ok_or_else(|| invalid_column(11, "stop_reason", value))
            })
            .transpose()?,
        payment_ref: row.get(12)?,
        created_at: parse_column(row, 13, "created_at", TimestampMs::parse_rfc3339)?,
        updated_at: parse_column(row, 14, "updated_at", TimestampMs::parse_rfc3339)?,
    })
}

fn parse_column<T>(
    row: &Row<'_>,
    index: usize,
    column: &'static str,
    parse: impl Fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let value: String = row.get(index)?;
    parse(&value).ok_or_else(|| invalid_column(index, column, value))
}

fn parse_optional_timestamp(
    row: &Row<'_>,
    index: usize,
    column: &'static str,
) -> rusqlite::Result<Option<TimestampMs>> {
    row.get::<_, Option<String>>(index)?
        .map(|value| {
            TimestampMs::parse_rfc3339(&value).ok_or_else(|| invalid_column(index, column, value))
        })
        .transpose()
}

fn invalid_column(index: usize, column: &'static str, value: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        Type::Text,
        Box::new(InvalidColumn { column, value }),
    )
}
