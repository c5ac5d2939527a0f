use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Schedule flags resolved by the external schedule oracle and attached
/// to each detection before it reaches the tracker.
///
/// The tracker never calls back into a scheduling system; it only reads
/// these pre-resolved flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleState {
    /// A class is on the books for this identity today.
    #[serde(default)]
    pub has_schedule: bool,
    /// That class is active right now, in this room.
    #[serde(default)]
    pub is_valid_schedule: bool,
    /// Arrival fell past the late-arrival grace period.
    #[serde(default)]
    pub is_late: bool,
}

impl ScheduleState {
    /// Whether this state selects the scheduled time-in/out event family.
    ///
    /// "Has a schedule but wrong room/time" is deliberately grouped with
    /// "no schedule at all": both fall into the unscheduled family.
    pub fn scheduled(&self) -> bool {
        self.has_schedule && self.is_valid_schedule
    }
}

/// One recognized face in one frame batch. Never retained past the frame
/// that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    /// Recognition label. `"Unknown"` is a valid identity and is tracked
    /// as its own independent session. `None` marks a malformed detection,
    /// which the tracker drops and counts.
    pub identity: Option<String>,
    /// Recognition confidence in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(default)]
    pub schedule: ScheduleState,
}

impl Detection {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            score: None,
            schedule: ScheduleState::default(),
        }
    }

    pub fn with_schedule(identity: impl Into<String>, schedule: ScheduleState) -> Self {
        Self {
            identity: Some(identity.into()),
            score: None,
            schedule,
        }
    }
}

/// Kind of an emitted attendance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Identity seen for the first time since its session was created.
    FirstDetected,
    /// Throttled "still here" heartbeat.
    Detection,
    /// Scheduled arrival (valid class session active).
    TimeIn,
    /// Scheduled departure, paired with an earlier `TimeIn`.
    TimeOut,
    /// Departed after the absence timeout expired.
    Left,
    /// Reappeared after having left.
    Returned,
    /// Present without a valid scheduled class.
    DetectedNoSchedule,
}

/// An emitted attendance event. Immutable once created; consumed by the
/// log sink in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub identity: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_minutes: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub absence_minutes: Option<f64>,
}

impl Event {
    pub fn new(kind: EventKind, identity: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            identity: identity.into(),
            timestamp,
            details: None,
            total_minutes: None,
            absence_minutes: None,
        }
    }
}

/// Read-only copy of a session for status/snapshot surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub identity: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_present: bool,
    pub total_minutes: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_at: Option<DateTime<Utc>>,
    pub schedule: ScheduleState,
    pub time_in_logged: bool,
    pub time_out_logged: bool,
}

/// Round to two decimal places, the precision attendance reports use
/// for minute totals.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Signed seconds from `a` to `b`, with sub-second precision.
pub(crate) fn secs_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (b - a).num_milliseconds() as f64 / 1000.0
}
