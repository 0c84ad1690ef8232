use crate::application::error::SessionError;
use crate::application::session_service::{SessionService, StartOrigin};
use crate::domain::models::{Session, SessionMode, TimerPolicy};
use crate::infrastructure::profile_repository::{LoopCounter, ProfileMirror};
use crate::infrastructure::session_store::SessionStore;
use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

const SHORT_BREAK_LABEL: &str = "Short Break";
const LONG_BREAK_LABEL: &str = "Long Break";

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The finished session was chained into `next`.
    Started {
        ended: Session,
        next: Session,
        loop_count: u32,
    },
    /// The finished session was a break or a stopwatch; nothing follows.
    Stopped { ended: Session },
}

/// Mode and label that follow a finished session.
///
/// Only a pomo chains. A finished break returns the owner to idle.
pub fn next_mode(
    finished: SessionMode,
    loop_count: u32,
    long_break_every: u32,
) -> Option<(SessionMode, &'static str)> {
    match finished {
        SessionMode::Pomo => {
            if long_break_every > 0 && loop_count % long_break_every == 0 {
                Some((SessionMode::LongBreak, LONG_BREAK_LABEL))
            } else {
                Some((SessionMode::ShortBreak, SHORT_BREAK_LABEL))
            }
        }
        SessionMode::ShortBreak | SessionMode::LongBreak | SessionMode::Stopwatch => None,
    }
}

/// Decides whether a user-started pomo begins a fresh cycle.
///
/// No history resets. A stopwatch as the most recent session resets. Otherwise
/// the cycle resets once the gap since the last session ended exceeds `gap`.
pub fn should_reset_cycle(
    last_completed: Option<&Session>,
    now: DateTime<Utc>,
    gap: Duration,
) -> bool {
    let Some(last) = last_completed else {
        return true;
    };
    if !last.mode.is_timed() {
        return true;
    }
    match last.state.ended_at() {
        Some(ended_at) => now - ended_at > gap,
        None => true,
    }
}

/// Clears the loop counter when the owner comes back after a long break from
/// the timer. Failures are logged; the start goes ahead either way.
pub(crate) async fn reset_stale_cycle<S, C>(
    store: &S,
    counter: &C,
    owner: &str,
    policy: &TimerPolicy,
    now: DateTime<Utc>,
) where
    S: SessionStore,
    C: LoopCounter,
{
    let last = match store.last_completed_session(owner).await {
        Ok(last) => last,
        Err(error) => {
            warn!(owner = %owner, error = %error, "could not read last completed session");
            return;
        }
    };

    if should_reset_cycle(last.as_ref(), now, policy.cycle_reset_gap()) {
        if let Err(error) = counter.set_count(owner, 0).await {
            warn!(owner = %owner, error = %error, "could not reset pomo loop counter");
        }
    }
}

pub struct ModeCycleController<S, P>
where
    S: SessionStore,
    P: ProfileMirror + LoopCounter,
{
    sessions: SessionService<S, P>,
}

impl<S, P> Clone for ModeCycleController<S, P>
where
    S: SessionStore,
    P: ProfileMirror + LoopCounter,
{
    fn clone(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
        }
    }
}

impl<S, P> ModeCycleController<S, P>
where
    S: SessionStore,
    P: ProfileMirror + LoopCounter,
{
    pub fn new(sessions: SessionService<S, P>) -> Self {
        Self { sessions }
    }

    /// Called when the owner's client reports that a timed session hit zero.
    pub async fn complete_timed(
        &self,
        owner: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<CycleOutcome, SessionError> {
        let session = self.sessions.find_owned(owner, session_id).await?;
        let ended = self.sessions.stop_snapshot(&session, now).await?;

        if ended.mode != SessionMode::Pomo {
            info!(owner = %ended.owner, finished = ended.mode.as_str(), "mode cycle stopped");
            return Ok(CycleOutcome::Stopped { ended });
        }
        let loop_count = self.bump_loop_count(&ended.owner).await;

        let Some((mode, label)) =
            next_mode(ended.mode, loop_count, self.sessions.policy().long_break_every)
        else {
            return Ok(CycleOutcome::Stopped { ended });
        };

        let next = self
            .sessions
            .start(&ended.owner, label, mode, StartOrigin::Auto, now)
            .await?;
        info!(
            owner = %ended.owner,
            finished = ended.mode.as_str(),
            next = mode.as_str(),
            loop_count,
            "mode cycle advanced"
        );
        Ok(CycleOutcome::Started {
            ended,
            next,
            loop_count,
        })
    }

    async fn current_loop_count(&self, owner: &str) -> u32 {
        match self.sessions.profiles().get_count(owner).await {
            Ok(count) => count,
            Err(error) => {
                warn!(owner = %owner, error = %error, "could not read pomo loop counter");
                0
            }
        }
    }

    async fn bump_loop_count(&self, owner: &str) -> u32 {
        let count = self.current_loop_count(owner).await.saturating_add(1);
        if let Err(error) = self.sessions.profiles().set_count(owner, count).await {
            warn!(owner = %owner, error = %error, "could not store pomo loop counter");
        }
        count
    }
}
