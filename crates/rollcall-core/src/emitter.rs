//! Event emitter — converts tracker transitions into throttled,
//! de-duplicated attendance events and keeps the bounded event ring.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use crate::config::TrackerConfig;
use crate::tracker::Transition;
use crate::types::{secs_between, Event, EventKind};

/// Derives outward-facing events from committed transitions. Performs no
/// I/O and never mutates session state; its only state is the heartbeat
/// throttle and the event ring.
pub struct EventEmitter {
    config: TrackerConfig,
    ring: VecDeque<Event>,
    /// Last `detection` heartbeat per identity.
    last_detection_log: HashMap<String, DateTime<Utc>>,
    /// Identities seen in the previous observe batch. Ticks do not touch
    /// this; "previous batch" means the previous frame, not the previous
    /// sweep.
    prev_batch: HashSet<String>,
}

impl EventEmitter {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            ring: VecDeque::with_capacity(config.max_log_buffer.min(512)),
            last_detection_log: HashMap::new(),
            prev_batch: HashSet::new(),
        }
    }

    /// Emit events for the transitions of one observe batch.
    pub fn on_observe(&mut self, transitions: &[Transition]) -> Vec<Event> {
        let mut batch: HashSet<String> = HashSet::new();
        let mut out = Vec::new();
        for tr in transitions {
            if let Transition::Seen { identity, at } = tr {
                batch.insert(identity.clone());
                if let Some(ev) = self.heartbeat(identity, *at) {
                    out.push(ev);
                }
            } else {
                out.push(self.event_for(tr));
            }
        }
        self.prev_batch = batch;
        for ev in &out {
            self.push_ring(ev.clone());
        }
        out
    }

    /// Emit events for the transitions of one wall-clock sweep, and prune
    /// throttle entries older than the retention horizon so the map stays
    /// bounded by live identities.
    pub fn on_tick(&mut self, transitions: &[Transition], now: DateTime<Utc>) -> Vec<Event> {
        let mut out = Vec::new();
        for tr in transitions {
            // Sweeps never produce heartbeats.
            if matches!(tr, Transition::Seen { .. }) {
                continue;
            }
            out.push(self.event_for(tr));
        }
        let horizon = self.config.retention_horizon();
        self.last_detection_log
            .retain(|_, logged| secs_between(*logged, now) <= horizon);
        for ev in &out {
            self.push_ring(ev.clone());
        }
        out
    }

    /// Per-identity heartbeat throttle: emit if the identity was not in
    /// the previous batch, or if the log interval has elapsed since its
    /// last heartbeat.
    fn heartbeat(&mut self, identity: &str, at: DateTime<Utc>) -> Option<Event> {
        let interval = self.config.detection_log_interval();
        let fresh = !self.prev_batch.contains(identity);
        let due = match self.last_detection_log.get(identity) {
            Some(last) => secs_between(*last, at) >= interval,
            None => true,
        };
        if !(fresh || due) {
            return None;
        }
        self.last_detection_log.insert(identity.to_string(), at);
        Some(Event::new(EventKind::Detection, identity, at))
    }

    fn event_for(&self, tr: &Transition) -> Event {
        match tr {
            Transition::FirstDetected { identity, at } => {
                Event::new(EventKind::FirstDetected, identity, *at)
            }
            Transition::TimeIn { identity, at, late } => {
                let mut ev = Event::new(EventKind::TimeIn, identity, *at);
                if *late {
                    ev.details = Some("late arrival".to_string());
                }
                ev
            }
            Transition::NoSchedule { identity, at } => {
                let mut ev = Event::new(EventKind::DetectedNoSchedule, identity, *at);
                ev.details = Some(format!("{identity} detected (no scheduled class)"));
                ev
            }
            Transition::Returned {
                identity,
                at,
                absence_minutes,
            } => {
                let mut ev = Event::new(EventKind::Returned, identity, *at);
                ev.absence_minutes = Some(*absence_minutes);
                ev
            }
            Transition::Left {
                identity,
                at,
                total_minutes,
            } => {
                let mut ev = Event::new(EventKind::Left, identity, *at);
                ev.total_minutes = Some(*total_minutes);
                ev
            }
            Transition::TimeOut {
                identity,
                at,
                total_minutes,
            } => {
                let mut ev = Event::new(EventKind::TimeOut, identity, *at);
                ev.total_minutes = Some(*total_minutes);
                ev
            }
            Transition::Seen { identity, at } => Event::new(EventKind::Detection, identity, *at),
        }
    }

    fn push_ring(&mut self, ev: Event) {
        if self.ring.len() == self.config.max_log_buffer {
            self.ring.pop_front();
        }
        self.ring.push_back(ev);
    }

    /// Ring contents, oldest first.
    pub fn recent(&self) -> impl Iterator<Item = &Event> {
        self.ring.iter()
    }

    pub fn ring_len(&self) -> usize {
        self.ring.len()
    }
}
