//! Elapsed-time arithmetic over session snapshots.
//!
//! Every function here is pure: callers fetch a snapshot, compute the new
//! values and persist them themselves.

use crate::domain::models::{Session, SessionState};
use chrono::{DateTime, Utc};

/// Seconds between `from` and `to`, never negative.
pub fn clamped_delta(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_seconds().max(0)
}

pub fn elapsed_seconds(session: &Session, now: DateTime<Utc>) -> i64 {
    match session.state {
        SessionState::Active { last_resumed_at } => session
            .accumulated_seconds
            .saturating_add(clamped_delta(last_resumed_at, now)),
        _ => session.accumulated_seconds,
    }
}

/// Result of banking the running segment when a session is paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PausedSnapshot {
    pub accumulated_seconds: i64,
    pub state: SessionState,
}

pub fn accumulate_on_pause(session: &Session, now: DateTime<Utc>) -> PausedSnapshot {
    PausedSnapshot {
        accumulated_seconds: elapsed_seconds(session, now),
        state: SessionState::Paused { paused_at: now },
    }
}

pub fn accumulate_on_resume(now: DateTime<Utc>) -> SessionState {
    SessionState::Active {
        last_resumed_at: now,
    }
}

/// Total credited to the day that ends at `midnight`. The running segment is
/// clamped at zero and capped at `max_segment_seconds`.
pub fn rollover_duration(
    session: &Session,
    midnight: DateTime<Utc>,
    max_segment_seconds: i64,
) -> i64 {
    let running = match session.state {
        SessionState::Active { last_resumed_at } => {
            clamped_delta(last_resumed_at, midnight).min(max_segment_seconds.max(0))
        }
        _ => 0,
    };
    session.accumulated_seconds.saturating_add(running)
}
