//! Single-writer engine loop.
//!
//! One dedicated thread owns the session map and the event ring; frame
//! batches, sweep ticks, and snapshot requests are delivered to it over a
//! bounded channel and processed strictly in arrival order, so observe and
//! tick can never interleave on the same session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rollcall_core::{
    Detection, Event, EventEmitter, PresenceTracker, SessionSnapshot, TrackerConfig,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Point-in-time view of the engine for status surfaces.
#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub sessions: Vec<SessionSnapshot>,
    pub recent_events: Vec<Event>,
    pub dropped_frames: u64,
    pub dropped_malformed: u64,
}

/// Messages delivered to the engine thread.
enum EngineRequest {
    Observe {
        batch: Vec<Detection>,
        at: DateTime<Utc>,
    },
    Tick {
        at: DateTime<Utc>,
    },
    Snapshot {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    events: broadcast::Sender<Event>,
    dropped_frames: Arc<AtomicU64>,
}

impl EngineHandle {
    /// Deliver one frame batch. Non-blocking: if the engine is behind,
    /// the frame is dropped and counted — frames are idempotent to lose,
    /// and presence math runs on carried timestamps, not frame counts.
    pub fn observe(&self, batch: Vec<Detection>, at: DateTime<Utc>) {
        if self
            .tx
            .try_send(EngineRequest::Observe { batch, at })
            .is_err()
        {
            let dropped = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::warn!(dropped, "engine queue full; frame dropped");
        }
    }

    /// Deliver one wall-clock sweep. A lost tick self-corrects: the next
    /// one carries the current wall clock, so no elapsed time is missed.
    pub fn tick(&self, at: DateTime<Utc>) {
        let _ = self.tx.try_send(EngineRequest::Tick { at });
    }

    /// Request a snapshot of sessions, recent events, and counters.
    pub async fn snapshot(&self) -> Result<EngineStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Snapshot { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Subscribe to the emitted event stream. A lagging subscriber skips
    /// events; it never stalls the engine.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Dropping every handle closes the request queue; the thread drains what
/// is already queued and exits. Shutdown is a lifecycle event, not a
/// detection outcome: no `left`/`time_out` is synthesized for sessions
/// that were simply unobserved when the queue closed.
pub fn spawn_engine(config: TrackerConfig, queue_depth: usize) -> EngineHandle {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(queue_depth.max(1));
    let (events_tx, _) = broadcast::channel::<Event>(config.max_log_buffer.max(1));
    let dropped_frames = Arc::new(AtomicU64::new(0));

    let worker_events = events_tx.clone();
    let worker_dropped = Arc::clone(&dropped_frames);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut tracker = PresenceTracker::new(config);
            let mut emitter = EventEmitter::new(config);

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Observe { batch, at } => {
                        let transitions = tracker.observe(&batch, at);
                        for event in emitter.on_observe(&transitions) {
                            // No subscribers is fine; the ring still holds
                            // the event for snapshots.
                            let _ = worker_events.send(event);
                        }
                    }
                    EngineRequest::Tick { at } => {
                        let transitions = tracker.tick(at);
                        for event in emitter.on_tick(&transitions, at) {
                            let _ = worker_events.send(event);
                        }
                    }
                    EngineRequest::Snapshot { reply } => {
                        let _ = reply.send(EngineStatus {
                            sessions: tracker.snapshots(),
                            recent_events: emitter.recent().cloned().collect(),
                            dropped_frames: worker_dropped.load(Ordering::Relaxed),
                            dropped_malformed: tracker.dropped_malformed(),
                        });
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    EngineHandle {
        tx,
        events: events_tx,
        dropped_frames,
    }
}
