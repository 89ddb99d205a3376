pub mod config;
pub mod controller;
mod error;
pub mod heartbeat;
mod logging;
pub mod reconciler;
mod runtime;
pub mod services;

pub use error::AppError;

use config::AppConfig;
use runtime::Runtime;

/// API and push heartbeat listener in one process.
pub fn run() -> Result<(), AppError> {
    runtime::run_combined(bootstrap("petwash_control")?)
}

pub fn run_api() -> Result<(), AppError> {
    let runtime = bootstrap("petwash_api")?;
    runtime::serve_api(&runtime)
}

pub fn run_service() -> Result<(), AppError> {
    runtime::run_listener(bootstrap("petwash_service")?)
}

pub fn run_reconcile_job() -> Result<(), AppError> {
    let runtime = bootstrap("reconcile_expired")?;
    runtime::reconcile_once(&runtime)
}

pub fn run_heartbeat_probe_job() -> Result<(), AppError> {
    let runtime = bootstrap("heartbeat_probe")?;
    runtime::probe_once(&runtime)
}

fn bootstrap(component: &str) -> Result<Runtime, AppError> {
    let dotenv = dotenvy::dotenv();
    logging::init()?;

    if let Err(error) = dotenv
        && !error.not_found()
    {
        tracing::warn!(error = %error, "failed to load .env file");
    }

    let config = AppConfig::from_env()?;

    tracing::info!(
        component,
        mqtt_host = %config.mqtt_host,
        mqtt_port = config.mqtt_port,
        command_topic_prefix = %config.command_topic_prefix,
        status_topic_prefix = %config.status_topic_prefix,
        db_path = %config.db_path,
        http_bind = %config.http_bind,
        "application bootstrap initialized"
    );

    Runtime::open(config)
}
