use crate::application::error::SessionError;
use crate::application::mode_cycle::reset_stale_cycle;
use crate::domain::accumulator::{accumulate_on_pause, accumulate_on_resume, elapsed_seconds};
use crate::domain::models::{
    normalize_label, ProfileStatus, Session, SessionMode, SessionState, SessionStatus, SessionView,
    TimerPolicy,
};
use crate::infrastructure::profile_repository::{LoopCounter, ProfileMirror};
use crate::infrastructure::session_store::{NewSession, SessionPatch, SessionStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOrigin {
    /// Punch-in requested by the owner.
    User,
    /// Chained by the mode cycle or by a midnight continuation.
    Auto,
}

pub struct SessionService<S, P>
where
    S: SessionStore,
    P: ProfileMirror + LoopCounter,
{
    session_store: Arc<S>,
    profiles: Arc<P>,
    policy: TimerPolicy,
}

impl<S, P> Clone for SessionService<S, P>
where
    S: SessionStore,
    P: ProfileMirror + LoopCounter,
{
    fn clone(&self) -> Self {
        Self {
            session_store: Arc::clone(&self.session_store),
            profiles: Arc::clone(&self.profiles),
            policy: self.policy.clone(),
        }
    }
}

impl<S, P> SessionService<S, P>
where
    S: SessionStore,
    P: ProfileMirror + LoopCounter,
{
    pub fn new(session_store: Arc<S>, profiles: Arc<P>) -> Self {
        Self {
            session_store,
            profiles,
            policy: TimerPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: TimerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &TimerPolicy {
        &self.policy
    }

    pub(crate) fn session_store(&self) -> &S {
        &self.session_store
    }

    pub(crate) fn profiles(&self) -> &P {
        &self.profiles
    }

    pub async fn current(&self, owner: &str) -> Result<Option<Session>, SessionError> {
        let owner = normalize_owner(owner)?;
        Ok(self.session_store.get_current_session(&owner).await?)
    }

    pub fn view(&self, session: Session, now: DateTime<Utc>) -> SessionView {
        let elapsed_seconds = elapsed_seconds(&session, now);
        let remaining_seconds = session
            .mode
            .target_seconds(&self.policy)
            .map(|target| (target - elapsed_seconds).max(0));
        SessionView {
            session,
            elapsed_seconds,
            remaining_seconds,
        }
    }

    pub async fn start(
        &self,
        owner: &str,
        label: &str,
        mode: SessionMode,
        origin: StartOrigin,
        now: DateTime<Utc>,
    ) -> Result<Session, SessionError> {
        let owner = normalize_owner(owner)?;
        let label = normalize_label(label, "label").map_err(SessionError::Validation)?;

        if let Some(existing) = self.session_store.get_current_session(&owner).await? {
            return Err(SessionError::InvalidState(format!(
                "owner {owner} already has an open session {}",
                existing.id
            )));
        }

        if origin == StartOrigin::User && mode == SessionMode::Pomo {
            reset_stale_cycle(
                self.session_store.as_ref(),
                self.profiles.as_ref(),
                &owner,
                &self.policy,
                now,
            )
            .await;
        }

        let session = self
            .session_store
            .create_session(NewSession {
                owner: owner.clone(),
                label,
                mode,
                started_at: now,
            })
            .await?;

        info!(
            owner = %owner,
            session_id = %session.id,
            mode = mode.as_str(),
            "session started"
        );
        self.sync_mirror(&owner, ProfileStatus::Active, Some(&session.label))
            .await;
        Ok(session)
    }

    pub async fn pause(
        &self,
        owner: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, SessionError> {
        let session = self.find_owned(owner, session_id).await?;
        if session.status() != SessionStatus::Active {
            return Err(SessionError::InvalidState(format!(
                "session {} is {}, only active sessions can be paused",
                session.id,
                session.status().as_str()
            )));
        }

        let paused = accumulate_on_pause(&session, now);
        let updated = self
            .session_store
            .update_session(
                &session.id,
                SessionPatch {
                    expected_status: Some(SessionStatus::Active),
                    accumulated_seconds: Some(paused.accumulated_seconds),
                    state: Some(paused.state),
                    ..SessionPatch::default()
                },
            )
            .await?;

        self.sync_mirror(&updated.owner, ProfileStatus::Paused, Some(&updated.label))
            .await;
        Ok(updated)
    }

    pub async fn resume(
        &self,
        owner: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, SessionError> {
        let session = self.find_owned(owner, session_id).await?;
        if session.status() != SessionStatus::Paused {
            return Err(SessionError::InvalidState(format!(
                "session {} is {}, only paused sessions can be resumed",
                session.id,
                session.status().as_str()
            )));
        }

        let updated = self
            .session_store
            .update_session(
                &session.id,
                SessionPatch {
                    expected_status: Some(SessionStatus::Paused),
                    state: Some(accumulate_on_resume(now)),
                    ..SessionPatch::default()
                },
            )
            .await?;

        self.sync_mirror(&updated.owner, ProfileStatus::Active, Some(&updated.label))
            .await;
        Ok(updated)
    }

    pub async fn stop(
        &self,
        owner: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Session, SessionError> {
        let session = self.find_owned(owner, session_id).await?;
        self.stop_snapshot(&session, now).await
    }

    /// Completes `session` using the snapshot the caller just fetched.
    pub(crate) async fn stop_snapshot(
        &self,
        session: &Session,
        now: DateTime<Utc>,
    ) -> Result<Session, SessionError> {
        if !session.is_open() {
            return Err(SessionError::InvalidState(format!(
                "session {} is already completed",
                session.id
            )));
        }

        let duration_seconds = elapsed_seconds(session, now);
        let updated = self
            .session_store
            .update_session(
                &session.id,
                SessionPatch {
                    expected_status: Some(session.status()),
                    state: Some(SessionState::Completed {
                        ended_at: now,
                        duration_seconds,
                    }),
                    ..SessionPatch::default()
                },
            )
            .await?;

        info!(
            owner = %updated.owner,
            session_id = %updated.id,
            duration_seconds,
            "session stopped"
        );
        self.sync_mirror(&updated.owner, ProfileStatus::Idle, None).await;
        Ok(updated)
    }

    /// Renames a session. Completed sessions may still be renamed.
    pub async fn rename(
        &self,
        owner: &str,
        session_id: &str,
        label: &str,
    ) -> Result<Session, SessionError> {
        let label = normalize_label(label, "label").map_err(SessionError::Validation)?;
        let session = self.find_owned(owner, session_id).await?;
        let updated = self
            .session_store
            .update_session(
                &session.id,
                SessionPatch {
                    label: Some(label),
                    ..SessionPatch::default()
                },
            )
            .await?;

        match updated.status() {
            SessionStatus::Active => {
                self.sync_mirror(&updated.owner, ProfileStatus::Active, Some(&updated.label))
                    .await;
            }
            SessionStatus::Paused => {
                self.sync_mirror(&updated.owner, ProfileStatus::Paused, Some(&updated.label))
                    .await;
            }
            SessionStatus::Completed => {}
        }
        Ok(updated)
    }

    pub(crate) async fn find_owned(
        &self,
        owner: &str,
        session_id: &str,
    ) -> Result<Session, SessionError> {
        let owner = normalize_owner(owner)?;
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(SessionError::Validation(
                "session_id must not be empty".to_string(),
            ));
        }

        match self.session_store.get_session(session_id).await? {
            Some(session) if session.owner == owner => Ok(session),
            _ => Err(SessionError::NotFound(format!("session {session_id}"))),
        }
    }

    /// Best-effort profile update; failures never undo the session write.
    pub(crate) async fn sync_mirror(
        &self,
        owner: &str,
        status: ProfileStatus,
        label: Option<&str>,
    ) {
        if let Err(error) = self.profiles.set_status(owner, status, label).await {
            warn!(
                owner = %owner,
                status = status.as_str(),
                error = %error,
                "profile mirror update failed"
            );
        }
    }
}

fn normalize_owner(owner: &str) -> Result<String, SessionError> {
    let owner = owner.trim();
    if owner.is_empty() {
        return Err(SessionError::Validation("owner must not be empty".to_string()));
    }
    Ok(owner.to_string())
}
