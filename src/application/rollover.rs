use crate::application::error::SessionError;
use crate::application::session_service::{SessionService, StartOrigin};
use crate::domain::accumulator::rollover_duration;
use crate::domain::day_boundary::{
    is_within_rollover_window, started_before_today, today_midnight,
};
use crate::domain::models::{
    normalize_label, ProfileStatus, Session, SessionState, SessionStatus, TimerPolicy,
};
use crate::infrastructure::profile_repository::{LoopCounter, ProfileMirror};
use crate::infrastructure::session_store::{SessionPatch, SessionStore};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::{info, warn};

const DEFAULT_CONTINUATION_LABEL: &str = "Untitled task";

/// One session split at midnight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RolloverOutcome {
    pub closed: Session,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuation: Option<Session>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RolloverReport {
    pub midnight: DateTime<Utc>,
    pub matched: usize,
    pub closed: usize,
    pub continued: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScheduledRolloverResult {
    Unauthorized,
    Skipped { local_time: String },
    Completed { report: RolloverReport },
}

pub struct RolloverService<S, P>
where
    S: SessionStore,
    P: ProfileMirror + LoopCounter,
{
    sessions: SessionService<S, P>,
    timezone: Tz,
}

impl<S, P> Clone for RolloverService<S, P>
where
    S: SessionStore,
    P: ProfileMirror + LoopCounter,
{
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            timezone: self.timezone,
        }
    }
}

impl<S, P> RolloverService<S, P>
where
    S: SessionStore,
    P: ProfileMirror + LoopCounter,
{
    pub fn new(sessions: SessionService<S, P>, timezone: Tz) -> Self {
        Self { sessions, timezone }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn policy(&self) -> &TimerPolicy {
        self.sessions.policy()
    }

    /// Splits every open session that started before today's reference
    /// midnight. Safe to run repeatedly.
    pub async fn rollover(&self, now: DateTime<Utc>) -> Result<RolloverReport, SessionError> {
        let midnight = today_midnight(now, self.timezone);
        let stale = self
            .sessions
            .session_store()
            .list_stale_open_sessions(midnight)
            .await?;

        let mut report = RolloverReport {
            midnight,
            matched: stale.len(),
            closed: 0,
            continued: 0,
            failed: 0,
        };

        for session in stale {
            match self.roll_session(&session, midnight, now).await {
                Ok(outcome) => {
                    report.closed += 1;
                    if outcome.continuation.is_some() {
                        report.continued += 1;
                    }
                }
                Err(error) => {
                    report.failed += 1;
                    warn!(
                        session_id = %session.id,
                        owner = %session.owner,
                        error = %error,
                        "rollover failed for session"
                    );
                }
            }
        }

        info!(
            midnight = %midnight,
            matched = report.matched,
            closed = report.closed,
            continued = report.continued,
            failed = report.failed,
            "rollover pass finished"
        );
        Ok(report)
    }

    /// Rolls the owner's current session if it started before today.
    /// `skip_session_id` is the continuation this caller opened last time.
    pub async fn rollover_owner(
        &self,
        owner: &str,
        skip_session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<RolloverOutcome>, SessionError> {
        let Some(current) = self.sessions.current(owner).await? else {
            return Ok(None);
        };
        if skip_session_id == Some(current.id.as_str())
            || !started_before_today(current.started_at, now, self.timezone)
        {
            return Ok(None);
        }

        let midnight = today_midnight(now, self.timezone);
        self.roll_session(&current, midnight, now).await.map(Some)
    }

    /// Entry point for the scheduled job: secret check, then the window
    /// check, then a full pass.
    pub async fn run_scheduled(
        &self,
        expected_secret: Option<&str>,
        authorization: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ScheduledRolloverResult, SessionError> {
        if !is_authorized(expected_secret, authorization) {
            warn!("scheduled rollover rejected: bad or missing credentials");
            return Ok(ScheduledRolloverResult::Unauthorized);
        }

        let window = self.sessions.policy().rollover_window();
        if !is_within_rollover_window(now, self.timezone, window) {
            let local_time = now
                .with_timezone(&self.timezone)
                .format("%Y-%m-%dT%H:%M:%S%:z")
                .to_string();
            info!(local_time = %local_time, "scheduled rollover skipped outside window");
            return Ok(ScheduledRolloverResult::Skipped { local_time });
        }

        let report = self.rollover(now).await?;
        Ok(ScheduledRolloverResult::Completed { report })
    }

    async fn roll_session(
        &self,
        session: &Session,
        midnight: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<RolloverOutcome, SessionError> {
        let original_status = session.status();
        let duration_seconds = rollover_duration(
            session,
            midnight,
            self.sessions.policy().max_segment_seconds(),
        );

        let closed = self
            .sessions
            .session_store()
            .update_session(
                &session.id,
                SessionPatch {
                    expected_status: Some(original_status),
                    state: Some(SessionState::Completed {
                        ended_at: midnight,
                        duration_seconds,
                    }),
                    ..SessionPatch::default()
                },
            )
            .await?;
        self.sessions
            .sync_mirror(&closed.owner, ProfileStatus::Idle, None)
            .await;

        if original_status != SessionStatus::Active {
            info!(
                session_id = %closed.id,
                duration_seconds,
                "paused session closed at midnight"
            );
            return Ok(RolloverOutcome {
                closed,
                continuation: None,
            });
        }

        let label = normalize_label(&closed.label, "label")
            .unwrap_or_else(|_| DEFAULT_CONTINUATION_LABEL.to_string());
        let continuation = match self
            .sessions
            .start(&closed.owner, &label, closed.mode, StartOrigin::Auto, now)
            .await
        {
            Ok(continuation) => Some(continuation),
            Err(error) => {
                warn!(
                    session_id = %closed.id,
                    owner = %closed.owner,
                    error = %error,
                    "could not open continuation after midnight split"
                );
                None
            }
        };

        info!(
            session_id = %closed.id,
            duration_seconds,
            continued = continuation.is_some(),
            "session rolled over at midnight"
        );
        Ok(RolloverOutcome {
            closed,
            continuation,
        })
    }
}

/// Checks an `Authorization: Bearer <secret>` value. A missing configured
/// secret rejects every caller.
pub fn is_authorized(expected_secret: Option<&str>, authorization: Option<&str>) -> bool {
    let Some(expected) = expected_secret.filter(|secret| !secret.is_empty()) else {
        return false;
    };
    let Some(provided) = authorization
        .map(str::trim)
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
    else {
        return false;
    };
    constant_time_eq(expected.as_bytes(), provided.as_bytes())
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    if left.len() != right.len() {
        return false;
    }
    left.iter()
        .zip(right)
        .fold(0u8, |diff, (a, b)| diff | (a ^ b))
        == 0
}
