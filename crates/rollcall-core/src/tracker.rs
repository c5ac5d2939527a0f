//! Presence tracker — one session per identity, advanced by detection
//! batches and by a wall-clock sweep that runs even when no frames arrive.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::config::TrackerConfig;
use crate::types::{round2, secs_between, Detection, ScheduleState, SessionSnapshot};

/// A committed state change for one identity. Transitions are what the
/// tracker hands to the event emitter; they carry everything the emitter
/// needs so it never reads session state back.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Session created: identity seen for the first time.
    FirstDetected {
        identity: String,
        at: DateTime<Utc>,
    },
    /// Scheduled arrival for the current presence interval.
    TimeIn {
        identity: String,
        at: DateTime<Utc>,
        late: bool,
    },
    /// Unscheduled presence for the current interval.
    NoSchedule {
        identity: String,
        at: DateTime<Utc>,
    },
    /// Identity observed in this batch; heartbeat candidate, throttled
    /// downstream.
    Seen {
        identity: String,
        at: DateTime<Utc>,
    },
    /// Identity reappeared after having left.
    Returned {
        identity: String,
        at: DateTime<Utc>,
        absence_minutes: f64,
    },
    /// Absence timeout expired; presence is credited only up to the last
    /// actual observation.
    Left {
        identity: String,
        at: DateTime<Utc>,
        total_minutes: f64,
    },
    /// Scheduled departure, paired with the interval's `TimeIn`.
    TimeOut {
        identity: String,
        at: DateTime<Utc>,
        total_minutes: f64,
    },
}

/// Per-identity presence record. Owned and mutated exclusively by
/// [`PresenceTracker`].
#[derive(Debug, Clone)]
struct Session {
    identity: String,
    first_seen: DateTime<Utc>,
    /// Last actual observation (a detection naming this identity).
    last_seen: DateTime<Utc>,
    is_present: bool,
    /// Committed presence seconds, including provisional accrual through
    /// short gaps.
    total_present_secs: f64,
    /// Presence seconds as of `last_seen`. On departure the total rolls
    /// back to this: an unobserved trailing gap is not credited.
    observed_secs: f64,
    /// Accrual cursor; advances on every observation and on every sweep
    /// that keeps the session present.
    accrued_at: DateTime<Utc>,
    left_at: Option<DateTime<Utc>>,
    time_in_logged: bool,
    time_out_logged: bool,
    no_schedule_logged: bool,
    /// Most recently observed schedule flags. The event family for an
    /// interval is decided from the flags at transition-to-present and
    /// held fixed for that interval.
    schedule: ScheduleState,
}

impl Session {
    fn new(identity: &str, now: DateTime<Utc>, schedule: ScheduleState) -> Self {
        Self {
            identity: identity.to_string(),
            first_seen: now,
            last_seen: now,
            is_present: true,
            total_present_secs: 0.0,
            observed_secs: 0.0,
            accrued_at: now,
            left_at: None,
            time_in_logged: false,
            time_out_logged: false,
            no_schedule_logged: false,
            schedule,
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            identity: self.identity.clone(),
            first_seen: self.first_seen,
            last_seen: self.last_seen,
            is_present: self.is_present,
            total_minutes: round2(self.total_present_secs / 60.0),
            left_at: self.left_at,
            schedule: self.schedule,
            time_in_logged: self.time_in_logged,
            time_out_logged: self.time_out_logged,
        }
    }
}

/// The session state machine. All timing comes from the `now` arguments;
/// the tracker never reads the system clock.
pub struct PresenceTracker {
    config: TrackerConfig,
    sessions: HashMap<String, Session>,
    dropped_malformed: u64,
}

impl PresenceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            sessions: HashMap::new(),
            dropped_malformed: 0,
        }
    }

    /// Fold one frame batch into the session map.
    ///
    /// Identities in the batch are created or refreshed; sessions absent
    /// from the batch go through the same idle check as [`tick`](Self::tick),
    /// so a single missed frame never flips presence.
    pub fn observe(&mut self, batch: &[Detection], now: DateTime<Utc>) -> Vec<Transition> {
        let mut out = Vec::new();
        let mut in_batch: HashSet<&str> = HashSet::new();
        let mut malformed = 0u64;

        for det in batch {
            let Some(identity) = det.identity.as_deref() else {
                malformed += 1;
                continue;
            };
            if !in_batch.insert(identity) {
                // Duplicate label within one frame; the first occurrence
                // already advanced the session.
                continue;
            }

            match self.sessions.get_mut(identity) {
                None => {
                    let mut session = Session::new(identity, now, det.schedule);
                    out.push(Transition::FirstDetected {
                        identity: identity.to_string(),
                        at: now,
                    });
                    Self::open_interval(&mut session, det.schedule, now, &mut out);
                    out.push(Transition::Seen {
                        identity: identity.to_string(),
                        at: now,
                    });
                    self.sessions.insert(identity.to_string(), session);
                }
                Some(session) => {
                    if now < session.last_seen {
                        tracing::debug!(
                            identity,
                            %now,
                            last_seen = %session.last_seen,
                            "clock moved backward; skipping observation"
                        );
                        continue;
                    }

                    if session.is_present {
                        let delta = secs_between(session.accrued_at, now).max(0.0);
                        session.total_present_secs += delta;
                    } else {
                        // Had left; this observation opens a fresh
                        // presence interval.
                        let absence = session
                            .left_at
                            .map(|left| secs_between(left, now).max(0.0))
                            .unwrap_or(0.0);
                        session.is_present = true;
                        session.left_at = None;
                        session.time_in_logged = false;
                        session.time_out_logged = false;
                        session.no_schedule_logged = false;
                        out.push(Transition::Returned {
                            identity: identity.to_string(),
                            at: now,
                            absence_minutes: round2(absence / 60.0),
                        });
                        Self::open_interval(session, det.schedule, now, &mut out);
                    }

                    session.accrued_at = now;
                    session.last_seen = now;
                    session.observed_secs = session.total_present_secs;
                    session.schedule = det.schedule;
                    out.push(Transition::Seen {
                        identity: identity.to_string(),
                        at: now,
                    });
                }
            }
        }

        if malformed > 0 {
            self.dropped_malformed += malformed;
            tracing::warn!(count = malformed, "dropped detections without an identity");
        }

        // Sessions missing from this batch are swept exactly like a tick:
        // presence flips only after the absence timeout, never after one
        // missed frame.
        let timeout = self.config.absence_timeout();
        for session in self.sessions.values_mut() {
            if !in_batch.contains(session.identity.as_str()) {
                Self::sweep(session, now, timeout, &mut out);
            }
        }

        out
    }

    /// Wall-clock sweep, called on a fixed interval independent of frame
    /// arrival. Detects identities that vanished from every frame, then
    /// garbage-collects completed sessions past the retention horizon.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Transition> {
        let mut out = Vec::new();
        let timeout = self.config.absence_timeout();
        for session in self.sessions.values_mut() {
            Self::sweep(session, now, timeout, &mut out);
        }
        self.collect_garbage(now);
        out
    }

    /// Decide the event family for a presence interval from the schedule
    /// flags captured at transition-to-present. The family is held fixed
    /// for the interval even if the flags later flip.
    fn open_interval(
        session: &mut Session,
        schedule: ScheduleState,
        now: DateTime<Utc>,
        out: &mut Vec<Transition>,
    ) {
        if schedule.scheduled() {
            if !session.time_in_logged {
                session.time_in_logged = true;
                out.push(Transition::TimeIn {
                    identity: session.identity.clone(),
                    at: now,
                    late: schedule.is_late,
                });
            }
        } else if !session.no_schedule_logged {
            session.no_schedule_logged = true;
            out.push(Transition::NoSchedule {
                identity: session.identity.clone(),
                at: now,
            });
        }
    }

    /// Shared idle check for ticks and for sessions missing from a batch.
    ///
    /// Short gaps keep accruing presence provisionally; once the timeout
    /// expires the total rolls back to the last observation, so departure
    /// is credited up to the last sighting rather than to `now`.
    fn sweep(session: &mut Session, now: DateTime<Utc>, timeout: f64, out: &mut Vec<Transition>) {
        if !session.is_present {
            return;
        }
        let idle = secs_between(session.last_seen, now);
        if idle <= 0.0 {
            // Same instant, or the clock moved backward: no-op.
            return;
        }
        if idle < timeout {
            let delta = secs_between(session.accrued_at, now).max(0.0);
            session.total_present_secs += delta;
            session.accrued_at = now;
            return;
        }

        session.total_present_secs = session.observed_secs;
        session.is_present = false;
        session.left_at = Some(now);
        let total_minutes = round2(session.total_present_secs / 60.0);
        out.push(Transition::Left {
            identity: session.identity.clone(),
            at: now,
            total_minutes,
        });
        if session.time_in_logged && !session.time_out_logged {
            session.time_out_logged = true;
            out.push(Transition::TimeOut {
                identity: session.identity.clone(),
                at: now,
                total_minutes,
            });
        }
    }

    /// Remove completed sessions whose departure is older than the
    /// retention horizon. A scheduled interval counts as completed once
    /// its `TimeOut` is logged; `TimeOut` is committed together with
    /// `Left`, so any departed session is eligible once the horizon
    /// passes. A re-observed identity afterwards starts a brand-new
    /// session.
    fn collect_garbage(&mut self, now: DateTime<Utc>) {
        let horizon = self.config.retention_horizon();
        self.sessions.retain(|identity, session| {
            if session.is_present {
                return true;
            }
            if session.time_in_logged && !session.time_out_logged {
                return true;
            }
            match session.left_at {
                Some(left) if secs_between(left, now) > horizon => {
                    tracing::debug!(identity = %identity, left_at = %left, "session retired");
                    false
                }
                _ => true,
            }
        });
    }

    /// Read-only snapshots of every live session.
    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut all: Vec<SessionSnapshot> = self.sessions.values().map(Session::snapshot).collect();
        all.sort_by(|a, b| a.identity.cmp(&b.identity));
        all
    }

    /// Detections dropped for carrying no identity.
    pub fn dropped_malformed(&self) -> u64 {
        self.dropped_malformed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    #[cfg(test)]
    fn session(&self, identity: &str) -> &Session {
        &self.sessions[identity]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn det(identity: &str) -> Detection {
        Detection::new(identity)
    }

    fn scheduled(identity: &str) -> Detection {
        Detection::with_schedule(
            identity,
            ScheduleState {
                has_schedule: true,
                is_valid_schedule: true,
                is_late: false,
            },
        )
    }

    fn late(identity: &str) -> Detection {
        Detection::with_schedule(
            identity,
            ScheduleState {
                has_schedule: true,
                is_valid_schedule: true,
                is_late: true,
            },
        )
    }

    fn kinds(transitions: &[Transition]) -> Vec<&'static str> {
        transitions
            .iter()
            .map(|tr| match tr {
                Transition::FirstDetected { .. } => "first_detected",
                Transition::TimeIn { .. } => "time_in",
                Transition::NoSchedule { .. } => "no_schedule",
                Transition::Seen { .. } => "seen",
                Transition::Returned { .. } => "returned",
                Transition::Left { .. } => "left",
                Transition::TimeOut { .. } => "time_out",
            })
            .collect()
    }

    #[test]
    fn test_first_detection_unscheduled() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        let out = tracker.observe(&[det("Quibral, Mark")], t(0));
        assert_eq!(kinds(&out), vec!["first_detected", "no_schedule", "seen"]);
        assert!(tracker.session("Quibral, Mark").is_present);
    }

    #[test]
    fn test_first_detection_scheduled_emits_time_in() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        let out = tracker.observe(&[scheduled("Garcia, Allen")], t(0));
        assert_eq!(kinds(&out), vec!["first_detected", "time_in", "seen"]);
        assert!(tracker.session("Garcia, Allen").time_in_logged);
    }

    #[test]
    fn test_late_flag_carried_on_time_in() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        let out = tracker.observe(&[late("Garcia, Allen")], t(0));
        assert!(out
            .iter()
            .any(|tr| matches!(tr, Transition::TimeIn { late: true, .. })));
    }

    #[test]
    fn test_wrong_room_schedule_is_unscheduled_family() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        let wrong_room = Detection::with_schedule(
            "Smith, John",
            ScheduleState {
                has_schedule: true,
                is_valid_schedule: false,
                is_late: false,
            },
        );
        let out = tracker.observe(&[wrong_room], t(0));
        assert_eq!(kinds(&out), vec!["first_detected", "no_schedule", "seen"]);
        assert!(!tracker.session("Smith, John").time_in_logged);
    }

    #[test]
    fn test_unknown_is_its_own_session() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        tracker.observe(&[det("Unknown"), det("Garcia, Allen")], t(0));
        assert_eq!(tracker.session_count(), 2);
        assert!(tracker.session("Unknown").is_present);
    }

    #[test]
    fn test_accrual_matches_wall_clock() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        tracker.observe(&[det("X")], t(0));
        tracker.observe(&[det("X")], t(10));
        tracker.observe(&[det("X")], t(30));
        assert_eq!(tracker.session("X").total_present_secs, 30.0);
    }

    #[test]
    fn test_accrual_batching_invariance() {
        // Dense 1 Hz observation and sparse observation of the same span
        // accrue the same total.
        let mut dense = PresenceTracker::new(TrackerConfig::default());
        for s in 0..=60 {
            dense.observe(&[det("X")], t(s));
        }

        let mut sparse = PresenceTracker::new(TrackerConfig::default());
        sparse.observe(&[det("X")], t(0));
        sparse.observe(&[det("X")], t(45));
        sparse.observe(&[det("X")], t(60));

        assert_eq!(
            dense.session("X").total_present_secs,
            sparse.session("X").total_present_secs
        );
    }

    #[test]
    fn test_missed_frame_does_not_flip_presence() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        tracker.observe(&[det("X")], t(0));
        let out = tracker.observe(&[], t(1));
        assert!(out.is_empty());
        assert!(tracker.session("X").is_present);
    }

    #[test]
    fn test_absence_timeout_boundary() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        tracker.observe(&[scheduled("Y")], t(0));

        // One second below the timeout: still present, time accrues.
        let out = tracker.tick(t(299));
        assert!(out.is_empty());
        assert!(tracker.session("Y").is_present);
        assert_eq!(tracker.session("Y").total_present_secs, 299.0);

        // Past the timeout: exactly one left + time_out, credited only up
        // to the last observation at t=0.
        let out = tracker.tick(t(301));
        assert_eq!(kinds(&out), vec!["left", "time_out"]);
        match &out[0] {
            Transition::Left { total_minutes, at, .. } => {
                assert_eq!(*total_minutes, 0.0);
                assert_eq!(*at, t(301));
            }
            other => panic!("expected left, got {other:?}"),
        }
        assert!(!tracker.session("Y").is_present);

        // Further ticks emit nothing for an already-departed session.
        assert!(tracker.tick(t(302)).is_empty());
    }

    #[test]
    fn test_departure_credits_only_observed_time() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        tracker.observe(&[scheduled("Y")], t(0));
        tracker.observe(&[scheduled("Y")], t(120));
        // Per-second sweeps accrue provisionally through the gap...
        for s in 121..=419 {
            tracker.tick(t(s));
        }
        // ...then the departure rolls the total back to the last sighting.
        let out = tracker.tick(t(420));
        match &out[0] {
            Transition::Left { total_minutes, .. } => assert_eq!(*total_minutes, 2.0),
            other => panic!("expected left, got {other:?}"),
        }
    }

    #[test]
    fn test_unscheduled_departure_has_no_time_out() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        tracker.observe(&[det("X")], t(0));
        let out = tracker.tick(t(300));
        assert_eq!(kinds(&out), vec!["left"]);
    }

    #[test]
    fn test_return_accounting_and_fresh_interval() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        tracker.observe(&[scheduled("Y")], t(0));
        tracker.tick(t(301));
        assert!(!tracker.session("Y").is_present);

        let out = tracker.observe(&[scheduled("Y")], t(400));
        assert_eq!(kinds(&out), vec!["returned", "time_in", "seen"]);
        match &out[0] {
            Transition::Returned {
                absence_minutes, ..
            } => assert_eq!(*absence_minutes, round2(99.0 / 60.0)),
            other => panic!("expected returned, got {other:?}"),
        }
        let session = tracker.session("Y");
        assert!(session.is_present);
        assert!(session.time_in_logged);
        assert!(!session.time_out_logged);
    }

    #[test]
    fn test_total_accumulates_across_intervals() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        tracker.observe(&[scheduled("Y")], t(0));
        tracker.observe(&[scheduled("Y")], t(60));
        tracker.tick(t(361));
        tracker.observe(&[scheduled("Y")], t(400));
        tracker.observe(&[scheduled("Y")], t(460));
        // 60s from the first interval plus 60s from the second.
        assert_eq!(tracker.session("Y").total_present_secs, 120.0);
        let out = tracker.tick(t(761));
        match &out[1] {
            Transition::TimeOut { total_minutes, .. } => assert_eq!(*total_minutes, 2.0),
            other => panic!("expected time_out, got {other:?}"),
        }
    }

    #[test]
    fn test_replay_idempotence() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        let first = tracker.observe(&[scheduled("Y")], t(10));
        assert_eq!(kinds(&first), vec!["first_detected", "time_in", "seen"]);

        // Identical batch at the identical instant: no accrual, no
        // repeated transition events.
        let replay = tracker.observe(&[scheduled("Y")], t(10));
        assert_eq!(kinds(&replay), vec!["seen"]);
        assert_eq!(tracker.session("Y").total_present_secs, 0.0);
    }

    #[test]
    fn test_duplicate_identity_in_one_batch() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        let out = tracker.observe(&[det("X"), det("X")], t(0));
        assert_eq!(kinds(&out), vec!["first_detected", "no_schedule", "seen"]);
        assert_eq!(tracker.session_count(), 1);
    }

    #[test]
    fn test_clock_backward_is_noop() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        tracker.observe(&[det("X")], t(100));
        let out = tracker.observe(&[det("X")], t(50));
        assert!(out.is_empty());
        assert_eq!(tracker.session("X").last_seen, t(100));
        assert_eq!(tracker.session("X").total_present_secs, 0.0);
        assert!(tracker.tick(t(50)).is_empty());
    }

    #[test]
    fn test_malformed_detections_counted_never_tracked() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        let malformed = Detection {
            identity: None,
            score: Some(0.9),
            schedule: ScheduleState::default(),
        };
        let out = tracker.observe(&[malformed.clone(), malformed, det("X")], t(0));
        assert_eq!(kinds(&out), vec!["first_detected", "no_schedule", "seen"]);
        assert_eq!(tracker.dropped_malformed(), 2);
        assert_eq!(tracker.session_count(), 1);
    }

    #[test]
    fn test_garbage_collection_after_horizon() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        tracker.observe(&[scheduled("Y")], t(0));
        tracker.tick(t(301)); // left + time_out at t=301
        assert_eq!(tracker.session_count(), 1);

        // Inside the horizon the session is retained.
        tracker.tick(t(301 + 3600));
        assert_eq!(tracker.session_count(), 1);

        // Past it, the session is retired...
        tracker.tick(t(301 + 3602));
        assert_eq!(tracker.session_count(), 0);

        // ...and a re-observed identity is brand-new.
        let out = tracker.observe(&[scheduled("Y")], t(301 + 3700));
        assert_eq!(kinds(&out), vec!["first_detected", "time_in", "seen"]);
        assert_eq!(tracker.session("Y").total_present_secs, 0.0);
    }

    #[test]
    fn test_unscheduled_sessions_also_retired() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        tracker.observe(&[det("Visitor")], t(0));
        tracker.tick(t(300)); // left, no time_out owed
        tracker.tick(t(300 + 3601));
        assert_eq!(tracker.session_count(), 0);
    }

    #[test]
    fn test_present_sessions_never_retired() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        tracker.observe(&[det("X")], t(0));
        // Keep observing across a span longer than the horizon.
        for s in (60..7200).step_by(60) {
            tracker.observe(&[det("X")], t(s));
        }
        assert_eq!(tracker.session_count(), 1);
        assert!(tracker.session("X").is_present);
    }

    #[test]
    fn test_snapshots_sorted_and_rounded() {
        let mut tracker = PresenceTracker::new(TrackerConfig::default());
        tracker.observe(&[det("B"), det("A")], t(0));
        tracker.observe(&[det("B"), det("A")], t(99));
        let snaps = tracker.snapshots();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].identity, "A");
        assert_eq!(snaps[1].identity, "B");
        assert_eq!(snaps[0].total_minutes, 1.65);
    }
}
