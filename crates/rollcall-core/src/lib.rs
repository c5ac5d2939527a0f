//! rollcall-core — Presence/session tracking for classroom attendance.
//!
//! Consumes per-frame face-detection snapshots and derives a bounded,
//! de-duplicated stream of attendance events: first appearance, scheduled
//! time-in/out, temporary absence, return, and unscheduled presence.
//!
//! The crate is purely synchronous: every entry point takes the current
//! wall-clock time as a parameter, so callers own the clock and tests are
//! deterministic.

pub mod config;
pub mod emitter;
pub mod tracker;
pub mod types;

pub use config::TrackerConfig;
pub use emitter::EventEmitter;
pub use tracker::{PresenceTracker, Transition};
pub use types::{Detection, Event, EventKind, ScheduleState, SessionSnapshot};
