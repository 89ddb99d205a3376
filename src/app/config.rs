use std::time::Duration;

use crate::adapters::mqtt::MqttSettings;
use crate::app::AppError;
use crate::domain::command_payload::TopicLayout;
use crate::domain::session_state::PhaseDurations;

const MIN_TIMEOUT_MS: u64 = 1_000;
const MAX_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id_prefix: String,
    pub mqtt_connect_timeout_ms: u64,
    pub mqtt_publish_timeout_ms: u64,
    pub command_topic_prefix: String,
    pub status_topic_prefix: String,
    pub heartbeat_probe_window_ms: u64,
    pub heartbeat_stale_after_seconds: i64,
    pub cleanup_phase_seconds: i64,
    pub courtesy_phase_seconds: i64,
    pub sanitizing_phase_seconds: i64,
    pub listener_retry_ms: u64,
    pub db_path: String,
    pub http_bind: String,
}

/// The parts of the configuration the controller, monitor and reconciler
/// share at runtime.
#[derive(Debug, Clone)]
pub struct ControlSettings {
    pub topics: TopicLayout,
    pub phases: PhaseDurations,
    pub probe_window: Duration,
    pub stale_after_seconds: i64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mqtt_host = non_empty(&lookup, "MQTT_HOST")
            .ok_or_else(|| AppError::config("MQTT_HOST is required"))?;

        Ok(Self {
            mqtt_host,
            mqtt_port: parse_or_default(&lookup, "MQTT_PORT", 1883_u16)?,
            mqtt_username: non_empty(&lookup, "MQTT_USERNAME"),
            mqtt_password: lookup("MQTT_PASSWORD").filter(|v| !v.is_empty()),
            mqtt_client_id_prefix: non_empty(&lookup, "MQTT_CLIENT_ID_PREFIX")
                .unwrap_or_else(|| "petwash-control".to_string()),
            mqtt_connect_timeout_ms: parse_timeout(&lookup, "MQTT_CONNECT_TIMEOUT_MS", 10_000)?,
            mqtt_publish_timeout_ms: parse_timeout(&lookup, "MQTT_PUBLISH_TIMEOUT_MS", 5_000)?,
            command_topic_prefix: topic_prefix(&lookup, "COMMAND_TOPIC_PREFIX", "stations")?,
            status_topic_prefix: topic_prefix(&lookup, "STATUS_TOPIC_PREFIX", "petwash")?,
            heartbeat_probe_window_ms: parse_timeout(
                &lookup,
                "HEARTBEAT_PROBE_WINDOW_MS",
                10_000,
            )?,
            heartbeat_stale_after_seconds: parse_positive(
                &lookup,
                "HEARTBEAT_STALE_AFTER_SECONDS",
                90_i64,
            )?,
            cleanup_phase_seconds: parse_positive(&lookup, "CLEANUP_PHASE_SECONDS", 120_i64)?,
            courtesy_phase_seconds: parse_positive(&lookup, "COURTESY_PHASE_SECONDS", 60_i64)?,
            sanitizing_phase_seconds: parse_positive(&lookup, "SANITIZING_PHASE_SECONDS", 90_i64)?,
            listener_retry_ms: parse_or_default(&lookup, "LISTENER_RETRY_MS", 5_000_u64)?,
            db_path: non_empty(&lookup, "DB_PATH")
                .unwrap_or_else(|| "/var/lib/petwash/petwash.db".to_string()),
            http_bind: non_empty(&lookup, "HTTP_BIND")
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        })
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            client_id_prefix: self.mqtt_client_id_prefix.clone(),
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            connect_timeout: Duration::from_millis(self.mqtt_connect_timeout_ms),
            publish_timeout: Duration::from_millis(self.mqtt_publish_timeout_ms),
        }
    }

    pub fn control_settings(&self) -> ControlSettings {
        ControlSettings {
            topics: TopicLayout {
                command_prefix: self.command_topic_prefix.clone(),
                status_prefix: self.status_topic_prefix.clone(),
            },
            phases: PhaseDurations {
                cleanup_seconds: self.cleanup_phase_seconds,
                courtesy_seconds: self.courtesy_phase_seconds,
                sanitizing_seconds: self.sanitizing_phase_seconds,
            },
            probe_window: Duration::from_millis(self.heartbeat_probe_window_ms),
            stale_after_seconds: self.heartbeat_stale_after_seconds,
        }
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or_default<T, F>(lookup: &F, key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr + Copy,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::config(format!("{key} must be a valid number"))),
        None => Ok(default),
    }
}

fn parse_positive<F>(lookup: &F, key: &str, default: i64) -> Result<i64, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or_default(lookup, key, default)?;
    if value <= 0 {
        return Err(AppError::config(format!("{key} must be greater than zero")));
    }
    Ok(value)
}

/// Transport waits must stay bounded: callers carry their own deadlines.
fn parse_timeout<F>(lookup: &F, key: &str, default: u64) -> Result<u64, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or_default(lookup, key, default)?;
    if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&value) {
        return Err(AppError::config(format!(
            "{key} must be between {MIN_TIMEOUT_MS} and {MAX_TIMEOUT_MS}"
        )));
    }
    Ok(value)
}

fn topic_prefix<F>(lookup: &F, key: &str, default: &str) -> Result<String, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = non_empty(lookup, key).unwrap_or_else(|| default.to_string());
    if value.contains(['+', '#']) || value.starts_with('/') || value.ends_with('/') {
        return Err(AppError::config(format!(
            "{key} must be a plain topic prefix without wildcards or edge slashes"
        )));
    }
    Ok(value)
}
