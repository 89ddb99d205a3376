use serde::{Deserialize, Serialize};

use crate::domain::session_state::TimestampMs;

pub const BROADCAST_SEGMENT: &str = "broadcast";
const OFFLINE_TOKEN: &str = "offline";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandKind {
    Start,
    Off,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationCommand {
    pub command: CommandKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    pub timestamp: String,
}

impl StationCommand {
    pub fn start(duration_seconds: i64, at: TimestampMs) -> Self {
        Self {
            command: CommandKind::Start,
            duration_minutes: Some(duration_minutes_rounded_up(duration_seconds)),
            timestamp: at.to_rfc3339(),
        }
    }

    pub fn off(at: TimestampMs) -> Self {
        Self {
            command: CommandKind::Off,
            duration_minutes: None,
            timestamp: at.to_rfc3339(),
        }
    }

    pub fn ping(at: TimestampMs) -> Self {
        Self {
            command: CommandKind::Ping,
            duration_minutes: None,
            timestamp: at.to_rfc3339(),
        }
    }

    pub fn to_payload(&self) -> Vec<u8> {
        // Only enum, Option<u32> and String fields; serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// The relay timer is minute-granular, so partial minutes are paid minutes.
fn duration_minutes_rounded_up(duration_seconds: i64) -> u32 {
    let seconds = duration_seconds.max(0) as u64;
    u32::try_from(seconds.div_ceil(60)).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicLayout {
    pub command_prefix: String,
    pub status_prefix: String,
}

impl Default for TopicLayout {
    fn default() -> Self {
        Self {
            command_prefix: "stations".to_string(),
            status_prefix: "petwash".to_string(),
        }
    }
}

impl TopicLayout {
    pub fn command_topic(&self, station_id: &str) -> String {
        format!("{}/{station_id}/command", self.command_prefix)
    }

    pub fn broadcast_topic(&self) -> String {
        self.command_topic(BROADCAST_SEGMENT)
    }

    pub fn status_topic(&self, station_id: &str) -> String {
        format!("{}/{station_id}/status", self.status_prefix)
    }

    pub fn status_filter(&self) -> String {
        format!("{}/+/status", self.status_prefix)
    }

    pub fn station_from_status_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.status_prefix.as_str())?;
        let rest = rest.strip_prefix('/')?;
        let station_id = rest.strip_suffix("/status")?;

        if station_id.is_empty() || station_id.contains('/') {
            return None;
        }
        Some(station_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSignal {
    Alive,
    /// Last-will: treat the station as down immediately.
    Offline,
}

/// Classifies a status payload. Empty payloads clear a retained message and
/// carry no liveness information.
pub fn parse_status_payload(payload: &[u8]) -> Option<StatusSignal> {
    let text = String::from_utf8_lossy(payload);
    let trimmed = text.trim().trim_matches('"');

    if trimmed.is_empty() {
        return None;
    }
    if trimmed.eq_ignore_ascii_case(OFFLINE_TOKEN) {
        return Some(StatusSignal::Offline);
    }
    Some(StatusSignal::Alive)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::domain::session_state::TimestampMs;

    use super::{StationCommand, StatusSignal, TopicLayout, parse_status_payload};

    #[test]
    fn serializes_start_command_with_rounded_minutes() {
        let command = StationCommand::start(301, TimestampMs(1_700_000_000_000));
        let value: serde_json::Value =
            serde_json::from_slice(&command.to_payload()).expect("payload should be json");

        assert_eq!(
            value,
            json!({
                "command": "START",
                "duration_minutes": 6,
                "timestamp": "2023-11-14T22:13:20.000Z"
            })
        );
    }

    #[test]
    fn off_command_omits_duration() {
        let command = StationCommand::off(TimestampMs(0));
        let value: serde_json::Value =
            serde_json::from_slice(&command.to_payload()).expect("payload should be json");

        assert_eq!(value["command"], "OFF");
        assert!(value.get("duration_minutes").is_none());
    }

    #[test]
    fn builds_station_topics() {
        let layout = TopicLayout::default();

        assert_eq!(layout.command_topic("S1"), "stations/S1/command");
        assert_eq!(layout.status_topic("S1"), "petwash/S1/status");
        assert_eq!(layout.status_filter(), "petwash/+/status");
        assert_eq!(layout.broadcast_topic(), "stations/broadcast/command");
    }

    #[test]
    fn extracts_station_id_from_status_topic() {
        let layout = TopicLayout::default();

        assert_eq!(
            layout.station_from_status_topic("petwash/S1/status"),
            Some("S1")
        );
        assert_eq!(layout.station_from_status_topic("petwash//status"), None);
        assert_eq!(layout.station_from_status_topic("petwash/a/b/status"), None);
        assert_eq!(layout.station_from_status_topic("stations/S1/status"), None);
    }

    #[test]
    fn offline_literal_is_case_insensitive() {
        assert_eq!(
            parse_status_payload(b"OFFLINE"),
            Some(StatusSignal::Offline)
        );
        assert_eq!(
            parse_status_payload(b" offline\n"),
            Some(StatusSignal::Offline)
        );
        assert_eq!(parse_status_payload(b"online"), Some(StatusSignal::Alive));
        assert_eq!(
            parse_status_payload(br#"{"uptime":12}"#),
            Some(StatusSignal::Alive)
        );
        assert_eq!(parse_status_payload(b""), None);
    }
}
