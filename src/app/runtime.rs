use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
};
use std::thread::JoinHandle;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{App, HttpServer, web};

use crate::adapters::api::{ApiState, configure_routes};
use crate::adapters::db::{open_connection, run_migrations};
use crate::adapters::mqtt::MqttConnector;
use crate::app::config::AppConfig;
use crate::app::error::AppError;
use crate::app::heartbeat::{HeartbeatMonitor, start_status_listener};
use crate::app::reconciler::ExpiryReconciler;
use crate::app::services::SqliteSessionService;
use crate::domain::session_state::SystemClock;

type LiveMonitor = HeartbeatMonitor<SqliteSessionService, MqttConnector, SystemClock>;

/// Shared startup for every entry point: database opened and migrated,
/// broker connector built from configuration.
pub struct Runtime {
    pub config: AppConfig,
    pub sessions: SqliteSessionService,
    pub connector: MqttConnector,
}

impl Runtime {
    pub fn open(config: AppConfig) -> Result<Self, AppError> {
        let mut connection = open_connection(&config.db_path).map_err(AppError::database_init)?;
        run_migrations(&mut connection).map_err(AppError::database_init)?;

        let sessions = SqliteSessionService::new(Arc::new(Mutex::new(connection)));
        let connector = MqttConnector::new(config.mqtt_settings());

        Ok(Self {
            config,
            sessions,
            connector,
        })
    }

    fn monitor(&self) -> LiveMonitor {
        let settings = self.config.control_settings();
        HeartbeatMonitor::new(
            self.sessions.clone(),
            self.connector.clone(),
            SystemClock,
            settings.topics,
            settings.probe_window,
            settings.stale_after_seconds,
        )
    }

    fn api_state(&self) -> ApiState<MqttConnector, SystemClock> {
        ApiState {
            sessions: self.sessions.clone(),
            connector: self.connector.clone(),
            clock: SystemClock,
            settings: self.config.control_settings(),
        }
    }

    fn start_listener(&self, stop_flag: Arc<AtomicBool>) -> JoinHandle<()> {
        start_status_listener(
            Arc::new(self.monitor()),
            Duration::from_millis(self.config.listener_retry_ms),
            stop_flag,
        )
    }
}

pub fn serve_api(runtime: &Runtime) -> Result<(), AppError> {
    let api_state = runtime.api_state();
    let bind = runtime.config.http_bind.clone();

    tracing::info!(bind = %bind, "http server starting");

    actix_web::rt::System::new()
        .block_on(async move {
            HttpServer::new(move || {
                App::new()
                    .wrap(Cors::permissive())
                    .app_data(web::Data::new(api_state.clone()))
                    .configure(configure_routes::<MqttConnector, SystemClock>)
            })
            .bind(&bind)?
            .run()
            .await
        })
        .map_err(AppError::runtime)
}

/// API plus the push listener in one process; the listener stops once the
/// server returns.
pub fn run_combined(runtime: Runtime) -> Result<(), AppError> {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let listener = runtime.start_listener(Arc::clone(&stop_flag));

    let server_result = serve_api(&runtime);

    stop_flag.store(true, Ordering::Relaxed);
    if listener.join().is_err() {
        return Err(AppError::runtime("status listener thread panicked"));
    }

    server_result
}

/// Push listener only; runs until the process receives a signal.
pub fn run_listener(runtime: Runtime) -> Result<(), AppError> {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let listener = runtime.start_listener(stop_flag);

    listener
        .join()
        .map_err(|_| AppError::runtime("status listener thread panicked"))
}

pub fn reconcile_once(runtime: &Runtime) -> Result<(), AppError> {
    let settings = runtime.config.control_settings();
    let reconciler = ExpiryReconciler::new(
        runtime.sessions.clone(),
        runtime.connector.clone(),
        SystemClock,
        settings.topics,
    );

    let report = reconciler.run_once().map_err(AppError::runtime)?;
    if report.errors > 0 {
        return Err(AppError::job_failed(format!(
            "{} expired sessions could not be reconciled",
            report.errors
        )));
    }
    Ok(())
}

pub fn probe_once(runtime: &Runtime) -> Result<(), AppError> {
    runtime
        .monitor()
        .probe_cycle()
        .map(|_| ())
        .map_err(AppError::runtime)
}
