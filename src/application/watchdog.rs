use crate::application::error::SessionError;
use crate::application::rollover::{RolloverOutcome, RolloverService};
use crate::application::session_service::SessionService;
use crate::domain::day_boundary::{is_near_midnight, reference_date};
use crate::domain::models::{Session, SessionState};
use crate::infrastructure::profile_repository::{LoopCounter, ProfileMirror};
use crate::infrastructure::session_store::SessionStore;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const NEAR_MIDNIGHT_POLL_SECONDS: i64 = 15;
const IDLE_POLL_SECONDS: i64 = 5 * 60;
const IDLE_WATCHDOG_TTL_MINUTES: i64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WatchdogEvent {
    SessionRolledOver { outcome: RolloverOutcome },
    PausedSessionExpired { session: Session },
}

/// Per-owner heartbeat: rolls the owner's session over midnight and stops
/// sessions left paused for too long.
#[derive(Debug, Clone)]
pub struct SessionWatchdog {
    owner: String,
    /// Continuation opened by the last roll and the reference date it belongs to.
    last_continuation: Option<(String, NaiveDate)>,
    last_expired_session_id: Option<String>,
}

impl SessionWatchdog {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            last_continuation: None,
            last_expired_session_id: None,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn next_poll_delay<S, P>(
        &self,
        rollover: &RolloverService<S, P>,
        now: DateTime<Utc>,
    ) -> Duration
    where
        S: SessionStore,
        P: ProfileMirror + LoopCounter,
    {
        if is_near_midnight(now, rollover.timezone(), rollover.policy().midnight_margin()) {
            Duration::seconds(NEAR_MIDNIGHT_POLL_SECONDS)
        } else {
            Duration::seconds(IDLE_POLL_SECONDS)
        }
    }

    pub async fn tick<S, P>(
        &mut self,
        sessions: &SessionService<S, P>,
        rollover: &RolloverService<S, P>,
        now: DateTime<Utc>,
    ) -> Result<Vec<WatchdogEvent>, SessionError>
    where
        S: SessionStore,
        P: ProfileMirror + LoopCounter,
    {
        let mut events = Vec::new();
        let policy = sessions.policy();

        if is_near_midnight(now, rollover.timezone(), policy.midnight_margin()) {
            let today = reference_date(now, rollover.timezone());
            let skip = self
                .last_continuation
                .as_ref()
                .filter(|(_, date)| *date == today)
                .map(|(id, _)| id.as_str());
            if let Some(outcome) = rollover.rollover_owner(&self.owner, skip, now).await? {
                self.last_continuation = outcome
                    .continuation
                    .as_ref()
                    .map(|continuation| (continuation.id.clone(), today));
                events.push(WatchdogEvent::SessionRolledOver { outcome });
            }
        }

        let Some(current) = sessions.current(&self.owner).await? else {
            return Ok(events);
        };
        let SessionState::Paused { paused_at } = current.state else {
            return Ok(events);
        };
        if now - paused_at <= policy.paused_expiry()
            || self.last_expired_session_id.as_deref() == Some(current.id.as_str())
        {
            return Ok(events);
        }

        let stopped = sessions.stop_snapshot(&current, now).await?;
        self.last_expired_session_id = Some(stopped.id.clone());
        info!(
            owner = %self.owner,
            session_id = %stopped.id,
            "paused session expired"
        );
        events.push(WatchdogEvent::PausedSessionExpired { session: stopped });
        Ok(events)
    }

    /// Runs ticks until the returned handle is aborted. Each tick finishes
    /// its writes before the task sleeps.
    pub fn spawn<S, P>(
        mut self,
        sessions: SessionService<S, P>,
        rollover: RolloverService<S, P>,
        events: UnboundedSender<WatchdogEvent>,
    ) -> JoinHandle<()>
    where
        S: SessionStore + 'static,
        P: ProfileMirror + LoopCounter + 'static,
    {
        tokio::spawn(async move {
            loop {
                match self.tick(&sessions, &rollover, Utc::now()).await {
                    Ok(batch) => {
                        for event in batch {
                            if events.send(event).is_err() {
                                debug!(owner = %self.owner, "watchdog listener dropped");
                                return;
                            }
                        }
                    }
                    Err(error) => {
                        warn!(owner = %self.owner, error = %error, "watchdog tick failed");
                    }
                }

                let delay = self
                    .next_poll_delay(&rollover, Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::from_secs(IDLE_POLL_SECONDS as u64));
                tokio::time::sleep(delay).await;
            }
        })
    }
}

struct RegistryEntry {
    watchdog: Arc<tokio::sync::Mutex<SessionWatchdog>>,
    last_seen: DateTime<Utc>,
}

/// Heartbeat watchdogs keyed by owner. The map lock is only held to look up
/// an entry, so one owner's tick never waits on another owner's store I/O.
pub struct WatchdogRegistry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
    idle_ttl: Duration,
}

impl Default for WatchdogRegistry {
    fn default() -> Self {
        Self::new(Duration::minutes(IDLE_WATCHDOG_TTL_MINUTES))
    }
}

impl WatchdogRegistry {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            idle_ttl,
        }
    }

    /// Returns the owner's watchdog, creating it on first use. Entries idle
    /// for longer than the TTL are dropped unless a tick still holds them.
    pub fn checkout(
        &self,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Arc<tokio::sync::Mutex<SessionWatchdog>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, entry| {
            key == owner
                || now - entry.last_seen <= self.idle_ttl
                || Arc::strong_count(&entry.watchdog) > 1
        });
        let evicted = before - entries.len();
        if evicted > 0 {
            debug!(evicted, "idle watchdogs evicted");
        }

        let entry = entries.entry(owner.to_string()).or_insert_with(|| RegistryEntry {
            watchdog: Arc::new(tokio::sync::Mutex::new(SessionWatchdog::new(owner))),
            last_seen: now,
        });
        entry.last_seen = now;
        Arc::clone(&entry.watchdog)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::session_service::StartOrigin;
    use crate::domain::models::{SessionMode, SessionStatus};
    use crate::infrastructure::profile_repository::InMemoryProfileRepository;
    use crate::infrastructure::session_store::InMemorySessionStore;
    use std::sync::Arc;

    type Services = (
        SessionService<InMemorySessionStore, InMemoryProfileRepository>,
        RolloverService<InMemorySessionStore, InMemoryProfileRepository>,
        Arc<InMemorySessionStore>,
    );

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn services() -> Services {
        let store = Arc::new(InMemorySessionStore::default());
        let sessions = SessionService::new(
            Arc::clone(&store),
            Arc::new(InMemoryProfileRepository::default()),
        );
        let rollover = RolloverService::new(sessions.clone(), chrono_tz::UTC);
        (sessions, rollover, store)
    }

    #[test]
    fn poll_delay_tightens_near_midnight() {
        let (_, rollover, _) = services();
        let watchdog = SessionWatchdog::new("user-1");
        assert_eq!(
            watchdog.next_poll_delay(&rollover, fixed_time("2026-03-01T23:55:00Z")),
            Duration::seconds(15)
        );
        assert_eq!(
            watchdog.next_poll_delay(&rollover, fixed_time("2026-03-01T15:00:00Z")),
            Duration::minutes(5)
        );
    }

    #[tokio::test]
    async fn paused_session_expires_once() {
        let (sessions, rollover, _) = services();
        let t0 = fixed_time("2026-03-01T12:00:00Z");
        let started = sessions
            .start("user-1", "Reading", SessionMode::Stopwatch, StartOrigin::User, t0)
            .await
            .expect("start");
        sessions
            .pause("user-1", &started.id, t0 + Duration::minutes(20))
            .await
            .expect("pause");

        let mut watchdog = SessionWatchdog::new("user-1");
        let early = watchdog
            .tick(&sessions, &rollover, t0 + Duration::minutes(70))
            .await
            .expect("early tick");
        assert!(early.is_empty());

        let events = watchdog
            .tick(&sessions, &rollover, t0 + Duration::minutes(90))
            .await
            .expect("expiry tick");
        assert_eq!(events.len(), 1);
        let WatchdogEvent::PausedSessionExpired { session } = &events[0] else {
            panic!("expected expiry event");
        };
        assert_eq!(session.id, started.id);
        assert_eq!(
            session.state,
            SessionState::Completed {
                ended_at: t0 + Duration::minutes(90),
                duration_seconds: 20 * 60,
            }
        );

        let later = watchdog
            .tick(&sessions, &rollover, t0 + Duration::minutes(95))
            .await
            .expect("later tick");
        assert!(later.is_empty());
    }

    #[tokio::test]
    async fn near_midnight_tick_rolls_session_once() {
        let (sessions, rollover, store) = services();
        let before = fixed_time("2026-03-01T23:30:00Z");
        let started = sessions
            .start("user-1", "Late push", SessionMode::Stopwatch, StartOrigin::User, before)
            .await
            .expect("start");

        let mut watchdog = SessionWatchdog::new("user-1");
        let not_yet = watchdog
            .tick(&sessions, &rollover, fixed_time("2026-03-01T23:55:00Z"))
            .await
            .expect("pre-midnight tick");
        assert!(not_yet.is_empty());

        let events = watchdog
            .tick(&sessions, &rollover, fixed_time("2026-03-02T00:00:30Z"))
            .await
            .expect("post-midnight tick");
        assert_eq!(events.len(), 1);
        let WatchdogEvent::SessionRolledOver { outcome } = &events[0] else {
            panic!("expected rollover event");
        };
        assert_eq!(outcome.closed.id, started.id);
        assert_eq!(outcome.closed.status(), SessionStatus::Completed);
        let continuation = outcome.continuation.clone().expect("continuation");
        assert_eq!(
            watchdog.last_continuation,
            Some((
                continuation.id.clone(),
                NaiveDate::from_ymd_opt(2026, 3, 2).expect("date")
            ))
        );

        let repeat = watchdog
            .tick(&sessions, &rollover, fixed_time("2026-03-02T00:00:45Z"))
            .await
            .expect("repeat tick");
        assert!(repeat.is_empty());
        assert_eq!(store.all().expect("all sessions").len(), 2);

        let next_night = watchdog
            .tick(&sessions, &rollover, fixed_time("2026-03-03T00:00:30Z"))
            .await
            .expect("next night tick");
        assert_eq!(next_night.len(), 1);
        let WatchdogEvent::SessionRolledOver { outcome } = &next_night[0] else {
            panic!("expected rollover event");
        };
        assert_eq!(outcome.closed.id, continuation.id);
    }

    #[tokio::test]
    async fn expiry_memory_keeps_only_the_last_session() {
        let (sessions, rollover, _) = services();
        let mut watchdog = SessionWatchdog::new("user-1");
        let mut now = fixed_time("2026-03-01T08:00:00Z");
        let mut expired = Vec::new();

        for label in ["Reading", "Writing", "Review"] {
            let started = sessions
                .start("user-1", label, SessionMode::Stopwatch, StartOrigin::User, now)
                .await
                .expect("start");
            sessions
                .pause("user-1", &started.id, now + Duration::minutes(10))
                .await
                .expect("pause");
            now += Duration::minutes(80);
            let events = watchdog
                .tick(&sessions, &rollover, now)
                .await
                .expect("expiry tick");
            assert_eq!(events.len(), 1);
            expired.push(started.id);
        }

        assert_eq!(watchdog.last_expired_session_id.as_ref(), expired.last());
    }

    #[test]
    fn registry_reuses_watchdog_per_owner() {
        let registry = WatchdogRegistry::default();
        let t0 = fixed_time("2026-03-01T12:00:00Z");
        let first = registry.checkout("user-1", t0);
        let again = registry.checkout("user-1", t0 + Duration::minutes(1));
        let other = registry.checkout("user-2", t0 + Duration::minutes(1));

        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn registry_evicts_idle_owners() {
        let registry = WatchdogRegistry::new(Duration::minutes(60));
        let t0 = fixed_time("2026-03-01T12:00:00Z");
        drop(registry.checkout("user-1", t0));
        drop(registry.checkout("user-2", t0 + Duration::minutes(30)));

        drop(registry.checkout("user-3", t0 + Duration::minutes(90)));
        assert_eq!(registry.len(), 2);

        drop(registry.checkout("user-3", t0 + Duration::hours(5)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registry_keeps_watchdogs_still_in_use() {
        let registry = WatchdogRegistry::new(Duration::minutes(60));
        let t0 = fixed_time("2026-03-01T12:00:00Z");
        let held = registry.checkout("user-1", t0);

        drop(registry.checkout("user-2", t0 + Duration::hours(3)));
        assert_eq!(registry.len(), 2);

        drop(held);
        drop(registry.checkout("user-2", t0 + Duration::hours(4)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn busy_owner_does_not_block_other_owners() {
        let registry = WatchdogRegistry::default();
        let t0 = fixed_time("2026-03-01T12:00:00Z");
        let busy = registry.checkout("user-1", t0);
        let _tick_in_progress = busy.lock().await;

        let other = registry.checkout("user-2", t0);
        assert!(other.try_lock().is_ok());
        assert!(busy.try_lock().is_err());
    }

    #[tokio::test]
    async fn spawned_watchdog_reports_events_until_aborted() {
        let (sessions, rollover, store) = services();
        let paused_at = Utc::now() - Duration::hours(2);
        store
            .insert(Session {
                id: "ses-stale".to_string(),
                owner: "user-1".to_string(),
                label: "Forgotten".to_string(),
                mode: SessionMode::Stopwatch,
                started_at: paused_at,
                accumulated_seconds: 30,
                state: SessionState::Paused { paused_at },
            })
            .expect("seed session");

        let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
        let handle = SessionWatchdog::new("user-1").spawn(sessions, rollover, sender);

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), receiver.recv())
            .await
            .expect("event before timeout")
            .expect("open channel");
        let session_id = match event {
            WatchdogEvent::PausedSessionExpired { session } => session.id,
            WatchdogEvent::SessionRolledOver { outcome } => outcome.closed.id,
        };
        assert_eq!(session_id, "ses-stale");

        handle.abort();
        assert!(handle.await.expect_err("aborted task").is_cancelled());
    }
}
