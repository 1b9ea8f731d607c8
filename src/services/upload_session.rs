use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::models::{SessionSnapshot, SessionState, UploadPhase, UploadProgress};

/// Advances of the current attempt kept for stall detection
const MAX_SAMPLES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    pub at: Instant,
    pub bytes_transferred: u64,
}

/// Live state of one upload. Owned by exactly one driver task.
#[derive(Debug)]
pub struct UploadSession {
    id: Uuid,
    state: SessionState,
    /// High-water mark across attempts; never decreases
    bytes_transferred: u64,
    total_bytes: u64,
    started_at: DateTime<Utc>,
    attempt_started_at: Instant,
    attempt_count: u32,
    /// Bytes of the current attempt; a retry starts again from zero
    attempt_bytes: u64,
    samples: VecDeque<ProgressSample>,
    progress_seen: bool,
    finalizing: bool,
    cancel: CancellationToken,
}

impl UploadSession {
    pub fn new(total_bytes: u64, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            bytes_transferred: 0,
            total_bytes,
            started_at: Utc::now(),
            attempt_started_at: Instant::now(),
            attempt_count: 0,
            attempt_bytes: 0,
            samples: VecDeque::with_capacity(MAX_SAMPLES),
            progress_seen: false,
            finalizing: false,
            cancel,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// When the current attempt last advanced, or began if it never has
    pub fn last_progress_at(&self) -> Instant {
        self.samples
            .back()
            .map_or(self.attempt_started_at, |sample| sample.at)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Forward-only, except Uploading <-> Stalled for the retry loop
    pub fn can_transition(from: SessionState, to: SessionState) -> bool {
        use SessionState::*;
        match (from, to) {
            (Idle, Validating) => true,
            (Validating, Compressing | Uploading) => true,
            (Compressing, Uploading) => true,
            (Uploading, Stalled | Succeeded) => true,
            (Stalled, Uploading) => true,
            (from, Failed | Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Applies a transition; refused transitions are a no-op
    pub fn transition(&mut self, to: SessionState) -> bool {
        if !Self::can_transition(self.state, to) {
            debug!(
                session_id = %self.id,
                "Ignoring transition {} -> {}",
                self.state.as_str(),
                to.as_str()
            );
            return false;
        }
        self.state = to;
        true
    }

    /// Replaces the payload size once compression has decided what gets sent
    pub fn set_total_bytes(&mut self, total_bytes: u64) {
        if !self.progress_seen {
            self.total_bytes = total_bytes;
        }
    }

    /// Moves to Uploading for a new attempt and returns its number (1-based)
    pub fn begin_attempt(&mut self, now: Instant) -> u32 {
        self.transition(SessionState::Uploading);
        self.attempt_count += 1;
        self.attempt_bytes = 0;
        self.attempt_started_at = now;
        self.samples.clear();
        self.attempt_count
    }

    /// Records a progress notification from the current attempt.
    ///
    /// Returns the caller-facing progress when the session-level value moved.
    pub fn record_progress(&mut self, bytes: u64, now: Instant) -> Option<UploadProgress> {
        if self.state != SessionState::Uploading {
            return None;
        }

        let bytes = bytes.min(self.total_bytes);
        let first = !self.progress_seen;
        self.progress_seen = true;

        if bytes > self.attempt_bytes || first {
            self.attempt_bytes = self.attempt_bytes.max(bytes);
            if self.samples.len() == MAX_SAMPLES {
                self.samples.pop_front();
            }
            self.samples.push_back(ProgressSample {
                at: now,
                bytes_transferred: self.attempt_bytes,
            });
        }

        if bytes > self.bytes_transferred || first {
            self.bytes_transferred = self.bytes_transferred.max(bytes);
            return Some(self.progress());
        }
        None
    }

    /// Percent of the current attempt, which is what the stall detector looks at
    pub fn attempt_percent(&self) -> f64 {
        percent_of(self.attempt_bytes, self.total_bytes)
    }

    /// Session-level percent shown to the caller
    pub fn percent(&self) -> f64 {
        percent_of(self.bytes_transferred, self.total_bytes)
    }

    pub fn phase(&self) -> UploadPhase {
        if self.finalizing {
            return UploadPhase::Finalizing;
        }
        UploadPhase::from_percent(self.percent(), self.progress_seen)
    }

    /// Transfer done, retrieval URL pending
    pub fn begin_finalizing(&mut self) {
        self.bytes_transferred = self.total_bytes;
        self.attempt_bytes = self.total_bytes;
        self.progress_seen = true;
        self.finalizing = true;
    }

    pub fn mark_stalled(&mut self) -> bool {
        self.transition(SessionState::Stalled)
    }

    /// Enters a terminal state. Only the first call wins; later ones return false.
    pub fn finish(&mut self, state: SessionState) -> bool {
        if !state.is_terminal() || self.is_terminal() {
            return false;
        }
        if !self.transition(state) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    pub fn progress(&self) -> UploadProgress {
        UploadProgress {
            session_id: self.id,
            percent: self.percent(),
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
            phase: self.phase(),
            attempt: self.attempt_count,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.id,
            state: self.state,
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
            percent: self.percent(),
            phase: self.phase(),
            attempt_count: self.attempt_count,
            started_at: self.started_at,
        }
    }
}

fn percent_of(bytes: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (bytes as f64 / total as f64) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn uploading(total: u64) -> UploadSession {
        let mut session = UploadSession::new(total, CancellationToken::new());
        assert!(session.transition(SessionState::Validating));
        session.begin_attempt(Instant::now());
        session
    }

    #[test]
    fn test_progress_is_monotonic_and_bounded() {
        let mut session = uploading(100);
        let now = Instant::now();

        assert_eq!(session.record_progress(40, now).unwrap().bytes_transferred, 40);
        assert!(session.record_progress(30, now).is_none());
        assert_eq!(session.bytes_transferred(), 40);
        assert_eq!(session.record_progress(500, now).unwrap().bytes_transferred, 100);
        assert!((session.percent() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_retry_keeps_high_water_mark() {
        let mut session = uploading(100);
        let now = Instant::now();
        session.record_progress(45, now);
        assert!(session.mark_stalled());

        assert_eq!(session.begin_attempt(now), 2);
        assert_eq!(session.state(), SessionState::Uploading);
        assert!(session.attempt_percent() < f64::EPSILON);

        // The retried transfer restarts from zero but the caller never sees a regression
        assert!(session.record_progress(10, now).is_none());
        assert_eq!(session.bytes_transferred(), 45);
        assert!((session.attempt_percent() - 10.0).abs() < f64::EPSILON);
        assert!(session.record_progress(60, now).is_some());
    }

    #[test]
    fn test_last_progress_only_moves_on_advance() {
        let mut session = uploading(100);
        let start = Instant::now();
        session.record_progress(20, start);

        let later = start + Duration::from_secs(8);
        session.record_progress(20, later);
        assert_eq!(session.last_progress_at(), start);

        session.record_progress(21, later);
        assert_eq!(session.last_progress_at(), later);
    }

    #[test]
    fn test_retry_restarts_stall_clock() {
        let mut session = uploading(100);
        let start = Instant::now();
        for step in 1..=(MAX_SAMPLES as u64 + 4) {
            session.record_progress(step, start + Duration::from_secs(step));
        }
        assert_eq!(session.samples.len(), MAX_SAMPLES);
        assert_eq!(
            session.last_progress_at(),
            start + Duration::from_secs(MAX_SAMPLES as u64 + 4)
        );

        // Stalled and retried: samples from the dead attempt no longer count
        assert!(session.mark_stalled());
        let retry_at = start + Duration::from_secs(60);
        session.begin_attempt(retry_at);
        assert_eq!(session.last_progress_at(), retry_at);
        assert!(session.samples.is_empty());
    }

    #[test]
    fn test_transitions_are_forward_only() {
        let mut session = uploading(10);
        assert!(!session.transition(SessionState::Validating));
        assert!(!session.transition(SessionState::Idle));
        assert!(session.mark_stalled());
        assert!(session.transition(SessionState::Uploading));
    }

    #[test]
    fn test_single_terminal_outcome() {
        let mut session = uploading(10);
        assert!(session.finish(SessionState::Succeeded));
        assert!(session.cancel_token().is_cancelled());
        assert!(!session.finish(SessionState::Cancelled));
        assert!(!session.finish(SessionState::Failed));
        assert_eq!(session.state(), SessionState::Succeeded);
        assert!(session.record_progress(5, Instant::now()).is_none());
    }

    #[test]
    fn test_phase_labels_follow_progress() {
        let mut session = uploading(1000);
        assert_eq!(session.phase(), UploadPhase::Initializing);
        session.record_progress(0, Instant::now());
        assert_eq!(session.phase(), UploadPhase::Uploading);
        session.record_progress(995, Instant::now());
        assert_eq!(session.phase(), UploadPhase::Finalizing);
    }
}
