use actix_web::{HttpResponse, web};
use serde::{Deserialize, Serialize};

use crate::adapters::mqtt::Connector;
use crate::app::config::ControlSettings;
use crate::app::controller::{
    AbortOutcome, ControllerError, CreateSessionRequest, SessionController, StartOutcome,
};
use crate::app::heartbeat::HeartbeatMonitor;
use crate::app::reconciler::ExpiryReconciler;
use crate::app::services::{ServiceError, SessionQueryHandler, SqliteSessionService};
use crate::domain::heartbeat::AdmissionError;
use crate::domain::models::{
    SessionStatus, SessionStep, Station, StationStatus, StopReason, WashSession,
};
use crate::domain::session_state::{Clock, TimestampMs};

const HARDWARE_FAILURE_MESSAGE: &str = "station did not respond, retry or contact support";

#[derive(Clone)]
pub struct ApiState<C, K> {
    pub sessions: SqliteSessionService,
    pub connector: C,
    pub clock: K,
    pub settings: ControlSettings,
}

impl<C, K> ApiState<C, K>
where
    C: Connector + Clone,
    K: Clock + Clone,
{
    fn controller(&self) -> SessionController<SqliteSessionService, C, K> {
        SessionController::new(
            self.sessions.clone(),
            self.connector.clone(),
            self.clock.clone(),
            self.settings.topics.clone(),
            self.settings.phases,
        )
    }

    fn reconciler(&self) -> ExpiryReconciler<SqliteSessionService, C, K> {
        ExpiryReconciler::new(
            self.sessions.clone(),
            self.connector.clone(),
            self.clock.clone(),
            self.settings.topics.clone(),
        )
    }

    fn monitor(&self) -> HeartbeatMonitor<SqliteSessionService, C, K> {
        HeartbeatMonitor::new(
            self.sessions.clone(),
            self.connector.clone(),
            self.clock.clone(),
            self.settings.topics.clone(),
            self.settings.probe_window,
            self.settings.stale_after_seconds,
        )
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOptionResponse {
    pub option_id: i64,
    pub name: String,
    pub price_cents: i64,
    pub duration_seconds: i64,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StationResponse {
    pub id: String,
    pub status: StationStatus,
    pub last_heartbeat_at: Option<String>,
    pub rules_gate: bool,
    pub cleanup: bool,
    pub courtesy: bool,
    pub sanitizing: bool,
    pub options: Vec<ServiceOptionResponse>,
}

impl From<Station> for StationResponse {
    fn from(station: Station) -> Self {
        Self {
            id: station.id,
            status: station.status,
            last_heartbeat_at: station.last_heartbeat_at.map(TimestampMs::to_rfc3339),
            rules_gate: station.capabilities.rules_gate,
            cleanup: station.capabilities.cleanup,
            courtesy: station.capabilities.courtesy,
            sanitizing: station.capabilities.sanitizing,
            options: station
                .options
                .into_iter()
                .map(|option| ServiceOptionResponse {
                    option_id: option.option_id,
                    name: option.name,
                    price_cents: option.price_cents,
                    duration_seconds: option.duration_seconds,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub id: String,
    pub station_id: String,
    pub user_id: Option<String>,
    pub option_id: i64,
    pub option_name: String,
    pub duration_seconds: i64,
    pub started_at: Option<String>,
    pub ends_at: String,
    pub step: SessionStep,
    pub phase_ends_at: Option<String>,
    pub status: SessionStatus,
    pub stop_reason: Option<StopReason>,
    pub payment_ref: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<WashSession> for SessionResponse {
    fn from(session: WashSession) -> Self {
        Self {
            id: session.id,
            station_id: session.station_id,
            user_id: session.user_id,
            option_id: session.option_id,
            option_name: session.option_name,
            duration_seconds: session.duration_seconds,
            started_at: session.started_at.map(TimestampMs::to_rfc3339),
            ends_at: session.ends_at.to_rfc3339(),
            step: session.step,
            phase_ends_at: session.phase_ends_at.map(TimestampMs::to_rfc3339),
            status: session.status,
            stop_reason: session.stop_reason,
            payment_ref: session.payment_ref,
            created_at: session.created_at.to_rfc3339(),
            updated_at: session.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub outcome: &'static str,
    pub started_at: String,
    pub ends_at: String,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub step: SessionStep,
    pub status: SessionStatus,
    pub off_sent: bool,
    pub already_closed: bool,
    pub non_refundable: bool,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdvanceResponse {
    pub step: SessionStep,
    pub status: SessionStatus,
    pub phase_ends_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub station_id: String,
    pub option_id: i64,
    pub user_id: Option<String>,
    pub payment_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StopBody {
    pub reason: StopReason,
}

#[derive(Debug, Deserialize)]
pub struct AdvanceBody {
    pub from: SessionStep,
    pub to: SessionStep,
}

#[derive(Debug, Deserialize)]
pub struct AbortBody {
    pub outcome: AbortOutcome,
}

#[derive(Debug, Deserialize)]
pub struct DiagnosticsLogQuery {
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsDbResponse {
    pub schema_version: u32,
    pub sessions_count: i64,
    pub active_sessions_count: i64,
    pub log_events_count: i64,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsLogEventResponse {
    pub id: String,
    pub created_at: String,
    pub level: String,
    pub code: String,
    pub message: String,
    pub source: String,
    pub station_id: Option<String>,
    pub session_id: Option<String>,
    pub details_json: Option<String>,
}

/// Handlers are generic over the broker connector and clock so tests can
/// drive them with a scripted transport and a fixed time.
pub fn configure_routes<C, K>(cfg: &mut web::ServiceConfig)
where
    C: Connector + Clone,
    K: Clock + Clone + Send + Sync + 'static,
{
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(
            web::resource("/stations/{station_id}/admission")
                .route(web::get().to(station_admission::<C, K>)),
        )
        .service(web::resource("/sessions").route(web::post().to(create_session::<C, K>)))
        .service(web::resource("/sessions/{session_id}").route(web::get().to(get_session::<C, K>)))
        .service(
            web::resource("/sessions/{session_id}/start")
                .route(web::post().to(start_session::<C, K>)),
        )
        .service(
            web::resource("/sessions/{session_id}/stop")
                .route(web::post().to(stop_session::<C, K>)),
        )
        .service(
            web::resource("/sessions/{session_id}/advance")
                .route(web::post().to(advance_session::<C, K>)),
        )
        .service(
            web::resource("/sessions/{session_id}/abort")
                .route(web::post().to(abort_session::<C, K>)),
        )
        .service(web::resource("/reconcile").route(web::post().to(reconcile::<C, K>)))
        .service(web::resource("/heartbeat/probe").route(web::post().to(heartbeat_probe::<C, K>)))
        .service(
            web::resource("/diagnostics/db").route(web::get().to(db_diagnostics::<C, K>)),
        )
        .service(
            web::resource("/diagnostics/log-events")
                .route(web::get().to(log_event_diagnostics::<C, K>)),
        );
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

async fn station_admission<C, K>(
    state: web::Data<ApiState<C, K>>,
    path: web::Path<String>,
) -> HttpResponse
where
    C: Connector + Clone,
    K: Clock + Clone + Send + Sync + 'static,
{
    let station_id = path.into_inner();
    match web::block(move || state.controller().admit(&station_id)).await {
        Ok(Ok(station)) => HttpResponse::Ok().json(StationResponse::from(station)),
        Ok(Err(error)) => controller_error_response(error),
        Err(error) => blocking_error_response(error),
    }
}

async fn create_session<C, K>(
    state: web::Data<ApiState<C, K>>,
    body: web::Json<CreateSessionBody>,
) -> HttpResponse
where
    C: Connector + Clone,
    K: Clock + Clone + Send + Sync + 'static,
{
    let body = body.into_inner();
    let request = CreateSessionRequest {
        station_id: body.station_id,
        option_id: body.option_id,
        user_id: body.user_id,
        payment_ref: body.payment_ref,
    };

    match web::block(move || state.controller().create_session(&request)).await {
        Ok(Ok(session)) => HttpResponse::Created().json(SessionResponse::from(session)),
        Ok(Err(error)) => controller_error_response(error),
        Err(error) => blocking_error_response(error),
    }
}

async fn get_session<C, K>(
    state: web::Data<ApiState<C, K>>,
    path: web::Path<String>,
) -> HttpResponse
where
    C: Connector + Clone,
    K: Clock + Clone + Send + Sync + 'static,
{
    let session_id = path.into_inner();
    match web::block(move || state.sessions.get_session(&session_id)).await {
        Ok(Ok(Some(session))) => HttpResponse::Ok().json(SessionResponse::from(session)),
        Ok(Ok(None)) => HttpResponse::NotFound().json(serde_json::json!({
            "error": "session not found"
        })),
        Ok(Err(error)) => service_error_response(error),
        Err(error) => blocking_error_response(error),
    }
}

async fn start_session<C, K>(
    state: web::Data<ApiState<C, K>>,
    path: web::Path<String>,
) -> HttpResponse
where
    C: Connector + Clone,
    K: Clock + Clone + Send + Sync + 'static,
{
    let session_id = path.into_inner();
    match web::block(move || state.controller().start(&session_id)).await {
        Ok(Ok(outcome)) => {
            let label = match outcome {
                StartOutcome::Started(_) => "started",
                StartOutcome::AlreadyRunning(_) => "alreadyRunning",
            };
            let timing = outcome.timing();
            HttpResponse::Ok().json(StartResponse {
                outcome: label,
                started_at: timing.started_at.to_rfc3339(),
                ends_at: timing.ends_at.to_rfc3339(),
            })
        }
        Ok(Err(error)) => controller_error_response(error),
        Err(error) => blocking_error_response(error),
    }
}

async fn stop_session<C, K>(
    state: web::Data<ApiState<C, K>>,
    path: web::Path<String>,
    body: web::Json<StopBody>,
) -> HttpResponse
where
    C: Connector + Clone,
    K: Clock + Clone + Send + Sync + 'static,
{
    let reason = body.into_inner().reason;
    if !matches!(reason, StopReason::Manual | StopReason::Auto) {
        return HttpResponse::BadRequest().json(serde_json::json!({
            "error": "reason must be manual or auto"
        }));
    }

    let session_id = path.into_inner();
    match web::block(move || state.controller().stop(&session_id, reason)).await {
        Ok(Ok(outcome)) => HttpResponse::Ok().json(StopResponse {
            step: outcome.step,
            status: outcome.status,
            off_sent: outcome.off_sent,
            already_closed: outcome.already_closed,
            non_refundable: outcome.non_refundable,
        }),
        Ok(Err(error)) => controller_error_response(error),
        Err(error) => blocking_error_response(error),
    }
}

async fn advance_session<C, K>(
    state: web::Data<ApiState<C, K>>,
    path: web::Path<String>,
    body: web::Json<AdvanceBody>,
) -> HttpResponse
where
    C: Connector + Clone,
    K: Clock + Clone + Send + Sync + 'static,
{
    let session_id = path.into_inner();
    let AdvanceBody { from, to } = body.into_inner();

    match web::block(move || state.controller().advance(&session_id, from, to)).await {
        Ok(Ok(outcome)) => HttpResponse::Ok().json(AdvanceResponse {
            step: outcome.step,
            status: outcome.status,
            phase_ends_at: outcome.phase_ends_at.map(TimestampMs::to_rfc3339),
        }),
        Ok(Err(error)) => controller_error_response(error),
        Err(error) => blocking_error_response(error),
    }
}

async fn abort_session<C, K>(
    state: web::Data<ApiState<C, K>>,
    path: web::Path<String>,
    body: web::Json<AbortBody>,
) -> HttpResponse
where
    C: Connector + Clone,
    K: Clock + Clone + Send + Sync + 'static,
{
    let session_id = path.into_inner();
    let outcome = body.into_inner().outcome;

    match web::block(move || state.controller().abort(&session_id, outcome)).await {
        Ok(Ok(session)) => HttpResponse::Ok().json(SessionResponse::from(session)),
        Ok(Err(error)) => controller_error_response(error),
        Err(error) => blocking_error_response(error),
    }
}

async fn reconcile<C, K>(state: web::Data<ApiState<C, K>>) -> HttpResponse
where
    C: Connector + Clone,
    K: Clock + Clone + Send + Sync + 'static,
{
    match web::block(move || state.reconciler().run_once()).await {
        Ok(Ok(report)) => HttpResponse::Ok().json(report),
        Ok(Err(error)) => service_error_response(error),
        Err(error) => blocking_error_response(error),
    }
}

async fn heartbeat_probe<C, K>(state: web::Data<ApiState<C, K>>) -> HttpResponse
where
    C: Connector + Clone,
    K: Clock + Clone + Send + Sync + 'static,
{
    match web::block(move || state.monitor().probe_cycle()).await {
        Ok(Ok(report)) => HttpResponse::Ok().json(report),
        Ok(Err(error)) => service_error_response(error),
        Err(error) => blocking_error_response(error),
    }
}

async fn db_diagnostics<C, K>(state: web::Data<ApiState<C, K>>) -> HttpResponse
where
    C: Connector + Clone,
    K: Clock + Clone + Send + Sync + 'static,
{
    let sessions = &state.sessions;
    let schema_version = match sessions.get_schema_version() {
        Ok(value) => value,
        Err(error) => return service_error_response(error),
    };
    let sessions_count = match sessions.count_sessions() {
        Ok(value) => value,
        Err(error) => return service_error_response(error),
    };
    let active_sessions_count = match sessions.count_active_sessions() {
        Ok(value) => value,
        Err(error) => return service_error_response(error),
    };
    let log_events_count = match sessions.count_log_events() {
        Ok(value) => value,
        Err(error) => return service_error_response(error),
    };

    HttpResponse::Ok().json(DiagnosticsDbResponse {
        schema_version,
        sessions_count,
        active_sessions_count,
        log_events_count,
    })
}

async fn log_event_diagnostics<C, K>(
    state: web::Data<ApiState<C, K>>,
    query: web::Query<DiagnosticsLogQuery>,
) -> HttpResponse
where
    C: Connector + Clone,
    K: Clock + Clone + Send + Sync + 'static,
{
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    match state.sessions.list_recent_log_events(limit) {
        Ok(events) => {
            let mapped: Vec<DiagnosticsLogEventResponse> = events
                .into_iter()
                .map(|event| DiagnosticsLogEventResponse {
                    id: event.id,
                    created_at: event.created_at,
                    level: event.level,
                    code: event.code,
                    message: event.message,
                    source: event.source,
                    station_id: event.station_id,
                    session_id: event.session_id,
                    details_json: event.details_json,
                })
                .collect();
            HttpResponse::Ok().json(mapped)
        }
        Err(error) => service_error_response(error),
    }
}

fn controller_error_response(error: ControllerError) -> HttpResponse {
    let message = error.to_string();
    match error {
        ControllerError::SessionNotFound(_)
        | ControllerError::StationNotFound(_)
        | ControllerError::Admission(AdmissionError::UnknownStation(_)) => {
            HttpResponse::NotFound().json(serde_json::json!({ "error": message }))
        }
        ControllerError::UnknownOption { .. } => {
            HttpResponse::BadRequest().json(serde_json::json!({ "error": message }))
        }
        ControllerError::Admission(_)
        | ControllerError::SessionClosed(_)
        | ControllerError::Transition(_)
        | ControllerError::Conflict { .. } => {
            HttpResponse::Conflict().json(serde_json::json!({ "error": message }))
        }
        ControllerError::Connect(_) | ControllerError::Hardware(_) => {
            HttpResponse::BadGateway().json(serde_json::json!({
                "error": HARDWARE_FAILURE_MESSAGE,
                "detail": message,
            }))
        }
        ControllerError::Store(error) => service_error_response(error),
    }
}

fn service_error_response(error: ServiceError) -> HttpResponse {
    match error {
        ServiceError::DbLockPoisoned => {
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": "database lock poisoned"
            }))
        }
        ServiceError::Database(error) => {
            HttpResponse::InternalServerError().json(serde_json::json!({
                "error": format!("database query failed: {error}")
            }))
        }
    }
}

fn blocking_error_response(error: actix_web::error::BlockingError) -> HttpResponse {
    tracing::error!(error = %error, "blocking task failed");
    HttpResponse::InternalServerError().json(serde_json::json!({
        "error": "request could not be processed"
    }))
}
