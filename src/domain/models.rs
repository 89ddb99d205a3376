use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::session_state::TimestampMs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StationStatus {
    Available,
    Busy,
    Offline,
    Maintenance,
}

impl StationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Busy => "BUSY",
            Self::Offline => "OFFLINE",
            Self::Maintenance => "MAINTENANCE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "AVAILABLE" => Some(Self::Available),
            "BUSY" => Some(Self::Busy),
            "OFFLINE" => Some(Self::Offline),
            "MAINTENANCE" => Some(Self::Maintenance),
            _ => None,
        }
    }
}

impl fmt::Display for StationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which optional workflow phases a station variant runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StationCapabilities {
    pub rules_gate: bool,
    pub cleanup: bool,
    pub courtesy: bool,
    pub sanitizing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOption {
    pub option_id: i64,
    pub name: String,
    pub price_cents: i64,
    pub duration_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Station {
    pub id: String,
    pub status: StationStatus,
    pub last_heartbeat_at: Option<TimestampMs>,
    pub capabilities: StationCapabilities,
    pub options: Vec<ServiceOption>,
}

impl Station {
    pub fn option(&self, option_id: i64) -> Option<&ServiceOption> {
        self.options
            .iter()
            .find(|option| option.option_id == option_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStep {
    Ready,
    Rules,
    Timer,
    Cleanup,
    Courtesy,
    Sanitizing,
    Rating,
}

impl SessionStep {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Rules => "rules",
            Self::Timer => "timer",
            Self::Cleanup => "cleanup",
            Self::Courtesy => "courtesy",
            Self::Sanitizing => "sanitizing",
            Self::Rating => "rating",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ready" => Some(Self::Ready),
            "rules" => Some(Self::Rules),
            "timer" => Some(Self::Timer),
            "cleanup" => Some(Self::Cleanup),
            "courtesy" => Some(Self::Courtesy),
            "sanitizing" => Some(Self::Sanitizing),
            "rating" => Some(Self::Rating),
            _ => None,
        }
    }

    pub fn is_post_run(self) -> bool {
        matches!(self, Self::Cleanup | Self::Courtesy | Self::Sanitizing)
    }
}

impl fmt::Display for SessionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Completed,
    Expired,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Expired => "EXPIRED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(Self::Active),
            "COMPLETED" => Some(Self::Completed),
            "EXPIRED" => Some(Self::Expired),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Manual,
    Auto,
    Expired,
    HardwareFailure,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::Expired => "expired",
            Self::HardwareFailure => "hardware_failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "auto" => Some(Self::Auto),
            "expired" => Some(Self::Expired),
            "hardware_failure" => Some(Self::HardwareFailure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WashSession {
    pub id: String,
    pub station_id: String,
    pub user_id: Option<String>,
    pub option_id: i64,
    pub option_name: String,
    pub duration_seconds: i64,
    pub started_at: Option<TimestampMs>,
    pub ends_at: TimestampMs,
    pub step: SessionStep,
    pub phase_ends_at: Option<TimestampMs>,
    pub status: SessionStatus,
    pub stop_reason: Option<StopReason>,
    pub payment_ref: Option<String>,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

impl WashSession {
    pub fn timing(&self) -> Option<SessionTiming> {
        self.started_at.map(|started_at| SessionTiming {
            started_at,
            ends_at: self.ends_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    pub started_at: TimestampMs,
    pub ends_at: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWashSession {
    pub station_id: String,
    pub user_id: Option<String>,
    pub option_id: i64,
    pub option_name: String,
    pub duration_seconds: i64,
    pub placeholder_ends_at: TimestampMs,
    pub payment_ref: Option<String>,
    pub created_at: TimestampMs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEventRecord {
    pub created_at: String,
    pub level: String,
    pub code: String,
    pub message: String,
    pub source: String,
    pub station_id: Option<String>,
    pub session_id: Option<String>,
    pub details_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogEventRecord {
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
