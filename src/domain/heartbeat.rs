use thiserror::Error;

use crate::domain::models::{Station, StationStatus};
use crate::domain::session_state::TimestampMs;

/// Maximum heartbeat age accepted when admitting a new paid session.
pub const HEARTBEAT_FRESHNESS_SECONDS: i64 = 90;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("station {0} does not exist")]
    UnknownStation(String),
    #[error("station is {status}")]
    NotAvailable { status: StationStatus },
    #[error("station has never reported a heartbeat")]
    NoHeartbeat,
    #[error("station heartbeat is {age_seconds}s old")]
    StaleHeartbeat { age_seconds: i64 },
}

pub fn heartbeat_age_millis(station: &Station, now: TimestampMs) -> Option<i64> {
    station
        .last_heartbeat_at
        .map(|last_seen| now.millis_since(last_seen))
}

/// Admission does not trust the cached status alone: it recomputes the
/// heartbeat age because the status column refreshes on a slower cadence.
pub fn check_admission(station: &Station, now: TimestampMs) -> Result<(), AdmissionError> {
    if station.status != StationStatus::Available {
        return Err(AdmissionError::NotAvailable {
            status: station.status,
        });
    }

    let age_millis = heartbeat_age_millis(station, now).ok_or(AdmissionError::NoHeartbeat)?;
    if age_millis > HEARTBEAT_FRESHNESS_SECONDS * 1_000 {
        // Rounded up so a rejected age never reads as within the limit.
        let age_seconds = (age_millis + 999).div_euclid(1_000);
        return Err(AdmissionError::StaleHeartbeat { age_seconds });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::domain::models::{Station, StationCapabilities, StationStatus};
    use crate::domain::session_state::TimestampMs;

    use super::{AdmissionError, check_admission};

    const NOW: TimestampMs = TimestampMs(1_700_000_000_000);

    fn station(status: StationStatus, last_heartbeat_at: Option<TimestampMs>) -> Station {
        Station {
            id: "S1".to_string(),
            status,
            last_heartbeat_at,
            capabilities: StationCapabilities::default(),
            options: Vec::new(),
        }
    }

    fn station_at(last_heartbeat_at: TimestampMs) -> Station {
        station(StationStatus::Available, Some(last_heartbeat_at))
    }

    #[test]
    fn admits_available_station_with_fresh_heartbeat() {
        let station = station(StationStatus::Available, Some(NOW.minus_seconds(30)));
        assert_eq!(check_admission(&station, NOW), Ok(()));
    }

    #[test]
    fn rejects_available_station_with_stale_heartbeat() {
        let station = station(StationStatus::Available, Some(NOW.minus_seconds(300)));
        assert_eq!(
            check_admission(&station, NOW),
            Err(AdmissionError::StaleHeartbeat { age_seconds: 300 })
        );
    }

    #[test]
    fn accepts_heartbeat_exactly_at_threshold() {
        let station = station(StationStatus::Available, Some(NOW.minus_seconds(90)));
        assert_eq!(check_admission(&station, NOW), Ok(()));
    }

    #[test]
    fn rejects_heartbeat_a_fraction_of_a_second_past_threshold() {
        let almost_91 = station_at(TimestampMs(NOW.minus_seconds(90).0 - 900));
        assert_eq!(
            check_admission(&almost_91, NOW),
            Err(AdmissionError::StaleHeartbeat { age_seconds: 91 })
        );

        let just_over = station_at(TimestampMs(NOW.minus_seconds(90).0 - 1));
        assert_eq!(
            check_admission(&just_over, NOW),
            Err(AdmissionError::StaleHeartbeat { age_seconds: 91 })
        );
    }

    #[test]
    fn rejects_missing_heartbeat_and_non_available_status() {
        assert_eq!(
            check_admission(&station(StationStatus::Available, None), NOW),
            Err(AdmissionError::NoHeartbeat)
        );
        assert_eq!(
            check_admission(&station(StationStatus::Busy, Some(NOW)), NOW),
            Err(AdmissionError::NotAvailable {
                status: StationStatus::Busy
            })
        );
    }
}
