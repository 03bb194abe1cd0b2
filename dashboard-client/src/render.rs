//! Render scheduling
//!
//! Decouples network arrival from display. Incoming frames land in a
//! single pending slot where the newest silently replaces the old one;
//! the display loop commits at most one frame per tick. A fast sender
//! can never queue frames faster than the display consumes them.

use common::ServerMessage;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A frame waiting in the pending slot
#[derive(Debug, Clone)]
pub struct PendingFrame {
    pub message: Arc<ServerMessage>,
    pub arrived_at: Instant,
}

#[derive(Debug, Default)]
pub struct RenderScheduler {
    slot: Option<PendingFrame>,
    /// Frames overwritten before ever being displayed
    replaced: u64,
    committed: u64,
    /// Commit timestamps within the last second, for display fps
    commits: VecDeque<Instant>,
    last_latency: Option<Duration>,
}

impl RenderScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&mut self, message: Arc<ServerMessage>) {
        self.submit_at(message, Instant::now());
    }

    pub fn submit_at(&mut self, message: Arc<ServerMessage>, now: Instant) {
        if self.slot.is_some() {
            self.replaced += 1;
        }
        self.slot = Some(PendingFrame {
            message,
            arrived_at: now,
        });
    }

    /// Take the pending frame for display, if any.
    ///
    /// Latency is measured from arrival of the committed frame, not of
    /// any frame it replaced.
    pub fn commit(&mut self) -> Option<PendingFrame> {
        self.commit_at(Instant::now())
    }

    pub fn commit_at(&mut self, now: Instant) -> Option<PendingFrame> {
        let frame = self.slot.take()?;
        self.last_latency = Some(now.saturating_duration_since(frame.arrived_at));
        self.committed += 1;
        self.commits.push_back(now);
        self.prune(now);
        Some(frame)
    }

    /// Display fps over the trailing one-second window
    pub fn fps(&mut self, now: Instant) -> f64 {
        self.prune(now);
        self.commits.len() as f64
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.last_latency
    }

    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn replaced(&self) -> u64 {
        self.replaced
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.commits.front() {
            if now.saturating_duration_since(front) > Duration::from_secs(1) {
                self.commits.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(seq: u64) -> Arc<ServerMessage> {
        Arc::new(ServerMessage {
            seq: Some(seq),
            ..Default::default()
        })
    }

    #[test]
    fn test_newest_replaces_pending() {
        let mut scheduler = RenderScheduler::new();
        scheduler.submit(msg(1));
        scheduler.submit(msg(2));
        scheduler.submit(msg(3));

        let frame = scheduler.commit().unwrap();
        assert_eq!(frame.message.seq, Some(3));
        assert_eq!(scheduler.replaced(), 2);
        assert_eq!(scheduler.committed(), 1);
    }

    #[test]
    fn test_commit_drains_slot() {
        let mut scheduler = RenderScheduler::new();
        scheduler.submit(msg(1));
        assert!(scheduler.commit().is_some());
        // one frame per tick at most; empty slot commits nothing
        assert!(scheduler.commit().is_none());
    }

    #[test]
    fn test_latency_measured_from_committed_frame() {
        let mut scheduler = RenderScheduler::new();
        let t0 = Instant::now();
        scheduler.submit_at(msg(1), t0);
        scheduler.submit_at(msg(2), t0 + Duration::from_millis(40));
        scheduler.commit_at(t0 + Duration::from_millis(50));

        // 50ms after the replaced frame, but 10ms after the committed one
        assert_eq!(scheduler.last_latency(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_fps_window_drops_old_commits() {
        let mut scheduler = RenderScheduler::new();
        let t0 = Instant::now();
        for i in 0..5u64 {
            scheduler.submit_at(msg(i), t0);
            scheduler.commit_at(t0 + Duration::from_millis(i * 100));
        }
        assert_eq!(scheduler.fps(t0 + Duration::from_millis(400)), 5.0);

        // two seconds later, everything has aged out of the window
        assert_eq!(scheduler.fps(t0 + Duration::from_secs(2)), 0.0);
    }
}
