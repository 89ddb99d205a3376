use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::domain::models::{SessionStep, StationCapabilities};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimestampMs(pub i64);

impl TimestampMs {
    pub fn plus_seconds(self, seconds: i64) -> Self {
        Self(self.0 + seconds * 1_000)
    }

    pub fn minus_seconds(self, seconds: i64) -> Self {
        Self(self.0 - seconds * 1_000)
    }

    pub fn seconds_since(self, earlier: TimestampMs) -> i64 {
        self.millis_since(earlier).div_euclid(1_000)
    }

    pub fn millis_since(self, earlier: TimestampMs) -> i64 {
        self.0 - earlier.0
    }

    /// Canonical store representation; fixed width so that text comparison in
    /// SQL orders the same way as the underlying instant.
    pub fn to_rfc3339(self) -> String {
        let datetime = DateTime::<Utc>::from_timestamp_millis(self.0)
            .unwrap_or_else(|| DateTime::<Utc>::from(std::time::UNIX_EPOCH));
        datetime.to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn parse_rfc3339(value: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|datetime| Self(datetime.timestamp_millis()))
    }
}

pub trait Clock {
    fn now(&self) -> TimestampMs;
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimestampMs {
        TimestampMs(Utc::now().timestamp_millis())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseDurations {
    pub cleanup_seconds: i64,
    pub courtesy_seconds: i64,
    pub sanitizing_seconds: i64,
}

impl Default for PhaseDurations {
    fn default() -> Self {
        Self {
            cleanup_seconds: 120,
            courtesy_seconds: 60,
            sanitizing_seconds: 90,
        }
    }
}

impl PhaseDurations {
    pub fn for_step(&self, step: SessionStep) -> Option<i64> {
        match step {
            SessionStep::Cleanup => Some(self.cleanup_seconds),
            SessionStep::Courtesy => Some(self.courtesy_seconds),
            SessionStep::Sanitizing => Some(self.sanitizing_seconds),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("session must pass the rules step before the timer can start")]
    RulesPending,
    #[error("transition {from} -> {to} is not allowed for this station")]
    NotAllowed { from: SessionStep, to: SessionStep },
}

/// Post-run phases a station variant goes through, in order.
pub fn post_run_phases(capabilities: &StationCapabilities) -> Vec<SessionStep> {
    let mut phases = Vec::with_capacity(3);
    if capabilities.cleanup {
        phases.push(SessionStep::Cleanup);
    }
    if capabilities.courtesy {
        phases.push(SessionStep::Courtesy);
    }
    if capabilities.sanitizing {
        phases.push(SessionStep::Sanitizing);
    }
    phases
}

pub fn step_after_timer(capabilities: &StationCapabilities) -> SessionStep {
    post_run_phases(capabilities)
        .first()
        .copied()
        .unwrap_or(SessionStep::Rating)
}

/// Checks whether `start` may actuate hardware from `step`.
pub fn check_startable(
    capabilities: &StationCapabilities,
    step: SessionStep,
) -> Result<(), TransitionError> {
    match step {
        SessionStep::Ready if capabilities.rules_gate => Err(TransitionError::RulesPending),
        SessionStep::Ready | SessionStep::Rules => Ok(()),
        other => Err(TransitionError::NotAllowed {
            from: other,
            to: SessionStep::Timer,
        }),
    }
}

/// Validates an `advance` edge. Entering `timer` is reserved for `start` and
/// leaving it for `stop`, so neither appears here.
pub fn check_advance(
    capabilities: &StationCapabilities,
    from: SessionStep,
    to: SessionStep,
) -> Result<(), TransitionError> {
    let not_allowed = TransitionError::NotAllowed { from, to };

    match from {
        SessionStep::Ready if to == SessionStep::Rules && capabilities.rules_gate => Ok(()),
        SessionStep::Cleanup | SessionStep::Courtesy | SessionStep::Sanitizing => {
            let phases = post_run_phases(capabilities);
            let Some(position) = phases.iter().position(|phase| *phase == from) else {
                return Err(not_allowed);
            };

            if to == SessionStep::Rating || phases[position + 1..].contains(&to) {
                Ok(())
            } else {
                Err(not_allowed)
            }
        }
        _ => Err(not_allowed),
    }
}
