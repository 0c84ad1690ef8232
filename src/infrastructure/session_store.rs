use crate::domain::models::{Session, SessionMode, SessionState, SessionStatus};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::open_connection;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_id(prefix: &str) -> String {
    let sequence = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{sequence}", Utc::now().timestamp_micros())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub owner: String,
    pub label: String,
    pub mode: SessionMode,
    pub started_at: DateTime<Utc>,
}

/// Partial update applied by [`SessionStore::update_session`]. When
/// `expected_status` is set the write only lands if the stored status still
/// matches it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    pub expected_status: Option<SessionStatus>,
    pub label: Option<String>,
    pub accumulated_seconds: Option<i64>,
    pub state: Option<SessionState>,
}

impl SessionPatch {
    fn apply(self, mut session: Session) -> Result<Session, InfraError> {
        if let Some(expected) = self.expected_status {
            if session.status() != expected {
                return Err(InfraError::Conflict(format!(
                    "session {} is {}, expected {}",
                    session.id,
                    session.status().as_str(),
                    expected.as_str()
                )));
            }
        }
        if let Some(label) = self.label {
            session.label = label;
        }
        if let Some(accumulated_seconds) = self.accumulated_seconds {
            session.accumulated_seconds = accumulated_seconds;
        }
        if let Some(state) = self.state {
            session.state = state;
        }
        Ok(session)
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fails with `Conflict` when the owner already has an open session.
    async fn create_session(&self, new_session: NewSession) -> Result<Session, InfraError>;

    async fn get_session(&self, id: &str) -> Result<Option<Session>, InfraError>;

    async fn get_current_session(&self, owner: &str) -> Result<Option<Session>, InfraError>;

    async fn update_session(&self, id: &str, patch: SessionPatch) -> Result<Session, InfraError>;

    /// Open sessions whose `started_at` is strictly before `before`.
    async fn list_stale_open_sessions(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Session>, InfraError>;

    async fn last_completed_session(&self, owner: &str) -> Result<Option<Session>, InfraError>;
}

#[derive(Debug, Clone)]
pub struct SqliteSessionStore {
    db_path: PathBuf,
}

const SESSION_COLUMNS: &str = "id, owner, label, mode, status, started_at, last_resumed_at, \
     paused_at, accumulated_seconds, ended_at, duration_seconds";

impl SqliteSessionStore {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }

    fn query_sessions(
        connection: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Session>, InfraError> {
        let mut statement = connection.prepare(sql)?;
        let rows = statement
            .query_map(params, SessionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }

    fn query_session(
        connection: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Option<Session>, InfraError> {
        connection
            .query_row(sql, params, SessionRow::from_row)
            .optional()?
            .map(SessionRow::into_session)
            .transpose()
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn create_session(&self, new_session: NewSession) -> Result<Session, InfraError> {
        let session = Session {
            id: next_id("ses"),
            owner: new_session.owner,
            label: new_session.label,
            mode: new_session.mode,
            started_at: new_session.started_at,
            accumulated_seconds: 0,
            state: SessionState::Active {
                last_resumed_at: new_session.started_at,
            },
        };
        let row = SessionRow::from_session(&session);
        let connection = self.connect()?;
        let inserted = connection.execute(
            "INSERT INTO sessions (id, owner, label, mode, status, started_at, last_resumed_at,
                                   paused_at, accumulated_seconds, ended_at, duration_seconds)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                row.id,
                row.owner,
                row.label,
                row.mode,
                row.status,
                row.started_at,
                row.last_resumed_at,
                row.paused_at,
                row.accumulated_seconds,
                row.ended_at,
                row.duration_seconds
            ],
        );
        match inserted {
            Ok(_) => Ok(session),
            Err(rusqlite::Error::SqliteFailure(error, _))
                if error.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(InfraError::Conflict(format!(
                    "owner {} already has an open session",
                    session.owner
                )))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, InfraError> {
        let connection = self.connect()?;
        Self::query_session(
            &connection,
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            params![id],
        )
    }

    async fn get_current_session(&self, owner: &str) -> Result<Option<Session>, InfraError> {
        let connection = self.connect()?;
        Self::query_session(
            &connection,
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE owner = ?1 AND status IN ('active', 'paused')
                 ORDER BY started_at DESC LIMIT 1"
            ),
            params![owner],
        )
    }

    async fn update_session(&self, id: &str, patch: SessionPatch) -> Result<Session, InfraError> {
        let mut connection = self.connect()?;
        let transaction = connection.transaction()?;
        let existing = Self::query_session(
            &transaction,
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            params![id],
        )?
        .ok_or_else(|| InfraError::NotFound(format!("session {id}")))?;
        let previous_status = existing.status();
        let updated = patch.apply(existing)?;
        let row = SessionRow::from_session(&updated);

        let changed = transaction.execute(
            "UPDATE sessions SET
               label = ?2, status = ?3, last_resumed_at = ?4, paused_at = ?5,
               accumulated_seconds = ?6, ended_at = ?7, duration_seconds = ?8
             WHERE id = ?1 AND status = ?9",
            params![
                row.id,
                row.label,
                row.status,
                row.last_resumed_at,
                row.paused_at,
                row.accumulated_seconds,
                row.ended_at,
                row.duration_seconds,
                previous_status.as_str()
            ],
        )?;
        if changed == 0 {
            return Err(InfraError::Conflict(format!(
                "session {id} changed during update"
            )));
        }
        transaction.commit()?;
        Ok(updated)
    }

    async fn list_stale_open_sessions(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Session>, InfraError> {
        let connection = self.connect()?;
        Self::query_sessions(
            &connection,
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE status IN ('active', 'paused') AND started_at < ?1
                 ORDER BY started_at ASC"
            ),
            params![format_timestamp(before)],
        )
    }

    async fn last_completed_session(&self, owner: &str) -> Result<Option<Session>, InfraError> {
        let connection = self.connect()?;
        Self::query_session(
            &connection,
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE owner = ?1 AND status = 'completed'
                 ORDER BY ended_at DESC LIMIT 1"
            ),
            params![owner],
        )
    }
}

/// Column-level representation of a session row.
struct SessionRow {
    id: String,
    owner: String,
    label: String,
    mode: String,
    status: String,
    started_at: String,
    last_resumed_at: Option<String>,
    paused_at: Option<String>,
    accumulated_seconds: i64,
    ended_at: Option<String>,
    duration_seconds: Option<i64>,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner: row.get(1)?,
            label: row.get(2)?,
            mode: row.get(3)?,
            status: row.get(4)?,
            started_at: row.get(5)?,
            last_resumed_at: row.get(6)?,
            paused_at: row.get(7)?,
            accumulated_seconds: row.get(8)?,
            ended_at: row.get(9)?,
            duration_seconds: row.get(10)?,
        })
    }

    fn from_session(session: &Session) -> Self {
        let (last_resumed_at, paused_at, ended_at, duration_seconds) = match session.state {
            SessionState::Active { last_resumed_at } => {
                (Some(format_timestamp(last_resumed_at)), None, None, None)
            }
            SessionState::Paused { paused_at } => (None, Some(format_timestamp(paused_at)), None, None),
            SessionState::Completed {
                ended_at,
                duration_seconds,
            } => (
                None,
                None,
                Some(format_timestamp(ended_at)),
                Some(duration_seconds),
            ),
        };
        Self {
            id: session.id.clone(),
            owner: session.owner.clone(),
            label: session.label.clone(),
            mode: session.mode.as_str().to_string(),
            status: session.status().as_str().to_string(),
            started_at: format_timestamp(session.started_at),
            last_resumed_at,
            paused_at,
            accumulated_seconds: session.accumulated_seconds,
            ended_at,
            duration_seconds,
        }
    }

    fn into_session(self) -> Result<Session, InfraError> {
        let mode = SessionMode::parse(&self.mode).ok_or_else(|| {
            InfraError::InvalidConfig(format!("invalid sessions.mode '{}'", self.mode))
        })?;
        let status = SessionStatus::parse(&self.status).ok_or_else(|| {
            InfraError::InvalidConfig(format!("invalid sessions.status '{}'", self.status))
        })?;
        let state = match status {
            SessionStatus::Active => SessionState::Active {
                last_resumed_at: parse_required(self.last_resumed_at.as_deref(), "last_resumed_at")?,
            },
            SessionStatus::Paused => SessionState::Paused {
                paused_at: parse_required(self.paused_at.as_deref(), "paused_at")?,
            },
            SessionStatus::Completed => SessionState::Completed {
                ended_at: parse_required(self.ended_at.as_deref(), "ended_at")?,
                duration_seconds: self.duration_seconds.unwrap_or(self.accumulated_seconds),
            },
        };
        Ok(Session {
            started_at: parse_timestamp(&self.started_at, "started_at")?,
            id: self.id,
            owner: self.owner,
            label: self.label,
            mode,
            accumulated_seconds: self.accumulated_seconds,
            state,
        })
    }
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str, field_name: &str) -> Result<DateTime<Utc>, InfraError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|error| {
            InfraError::InvalidConfig(format!("invalid sessions.{field_name} '{raw}': {error}"))
        })
}

fn parse_required(raw: Option<&str>, field_name: &str) -> Result<DateTime<Utc>, InfraError> {
    let raw = raw.ok_or_else(|| {
        InfraError::InvalidConfig(format!("sessions.{field_name} is missing"))
    })?;
    parse_timestamp(raw, field_name)
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<Vec<Session>>,
}

impl InMemorySessionStore {
    fn lock(&self) -> Result<MutexGuard<'_, Vec<Session>>, InfraError> {
        self.sessions
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("session store lock poisoned: {error}")))
    }

    /// Inserts a session as-is, bypassing the open-session check.
    pub fn insert(&self, session: Session) -> Result<(), InfraError> {
        self.lock()?.push(session);
        Ok(())
    }

    pub fn all(&self) -> Result<Vec<Session>, InfraError> {
        Ok(self.lock()?.clone())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(&self, new_session: NewSession) -> Result<Session, InfraError> {
        let mut sessions = self.lock()?;
        if sessions
            .iter()
            .any(|session| session.owner == new_session.owner && session.is_open())
        {
            return Err(InfraError::Conflict(format!(
                "owner {} already has an open session",
                new_session.owner
            )));
        }
        let session = Session {
            id: next_id("ses"),
            owner: new_session.owner,
            label: new_session.label,
            mode: new_session.mode,
            started_at: new_session.started_at,
            accumulated_seconds: 0,
            state: SessionState::Active {
                last_resumed_at: new_session.started_at,
            },
        };
        sessions.push(session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Option<Session>, InfraError> {
        Ok(self.lock()?.iter().find(|session| session.id == id).cloned())
    }

    async fn get_current_session(&self, owner: &str) -> Result<Option<Session>, InfraError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|session| session.owner == owner && session.is_open())
            .max_by_key(|session| session.started_at)
            .cloned())
    }

    async fn update_session(&self, id: &str, patch: SessionPatch) -> Result<Session, InfraError> {
        let mut sessions = self.lock()?;
        let slot = sessions
            .iter_mut()
            .find(|session| session.id == id)
            .ok_or_else(|| InfraError::NotFound(format!("session {id}")))?;
        let updated = patch.apply(slot.clone())?;
        *slot = updated.clone();
        Ok(updated)
    }

    async fn list_stale_open_sessions(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Session>, InfraError> {
        let mut stale = self
            .lock()?
            .iter()
            .filter(|session| session.is_open() && session.started_at < before)
            .cloned()
            .collect::<Vec<_>>();
        stale.sort_by_key(|session| session.started_at);
        Ok(stale)
    }

    async fn last_completed_session(&self, owner: &str) -> Result<Option<Session>, InfraError> {
        Ok(self
            .lock()?
            .iter()
            .filter(|session| session.owner == owner)
            .filter_map(|session| session.state.ended_at().map(|ended_at| (ended_at, session)))
            .max_by_key(|(ended_at, _)| *ended_at)
            .map(|(_, session)| session.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::initialize_database;
    use chrono::Duration;
    use std::fs;
    use std::sync::atomic::AtomicUsize;

    static NEXT_TEMP_DB: AtomicUsize = AtomicUsize::new(0);

    struct TempDatabase {
        dir: PathBuf,
        path: PathBuf,
    }

    impl TempDatabase {
        fn new() -> Self {
            let sequence = NEXT_TEMP_DB.fetch_add(1, Ordering::Relaxed);
            let dir = std::env::temp_dir().join(format!(
                "locked-in-store-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&dir).expect("create temp dir");
            let path = dir.join("sessions.sqlite");
            initialize_database(&path).expect("initialize database");
            Self { dir, path }
        }
    }

    impl Drop for TempDatabase {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn new_session(owner: &str, started_at: DateTime<Utc>) -> NewSession {
        NewSession {
            owner: owner.to_string(),
            label: "Deep work".to_string(),
            mode: SessionMode::Pomo,
            started_at,
        }
    }

    #[tokio::test]
    async fn sqlite_store_roundtrips_every_state() {
        let database = TempDatabase::new();
        let store = SqliteSessionStore::new(&database.path);
        let started_at = fixed_time("2026-02-16T09:00:00Z");

        let created = store
            .create_session(new_session("user-1", started_at))
            .await
            .expect("create session");
        assert_eq!(
            store.get_current_session("user-1").await.expect("current"),
            Some(created.clone())
        );

        let paused = store
            .update_session(
                &created.id,
                SessionPatch {
                    expected_status: Some(SessionStatus::Active),
                    accumulated_seconds: Some(125),
                    state: Some(SessionState::Paused {
                        paused_at: started_at + Duration::seconds(125),
                    }),
                    ..SessionPatch::default()
                },
            )
            .await
            .expect("pause session");
        assert_eq!(
            store.get_session(&created.id).await.expect("get"),
            Some(paused)
        );

        let completed = store
            .update_session(
                &created.id,
                SessionPatch {
                    expected_status: Some(SessionStatus::Paused),
                    state: Some(SessionState::Completed {
                        ended_at: started_at + Duration::seconds(300),
                        duration_seconds: 125,
                    }),
                    ..SessionPatch::default()
                },
            )
            .await
            .expect("complete session");
        assert!(store.get_current_session("user-1").await.expect("current").is_none());
        assert_eq!(
            store.last_completed_session("user-1").await.expect("last completed"),
            Some(completed)
        );
    }

    #[tokio::test]
    async fn sqlite_store_rejects_second_open_session_per_owner() {
        let database = TempDatabase::new();
        let store = SqliteSessionStore::new(&database.path);
        let started_at = fixed_time("2026-02-16T09:00:00Z");

        store
            .create_session(new_session("user-1", started_at))
            .await
            .expect("first session");
        let second = store.create_session(new_session("user-1", started_at)).await;
        assert!(matches!(second, Err(InfraError::Conflict(_))));

        store
            .create_session(new_session("user-2", started_at))
            .await
            .expect("other owner unaffected");
    }

    #[tokio::test]
    async fn sqlite_store_rejects_stale_expected_status() {
        let database = TempDatabase::new();
        let store = SqliteSessionStore::new(&database.path);
        let created = store
            .create_session(new_session("user-1", fixed_time("2026-02-16T09:00:00Z")))
            .await
            .expect("create session");

        let result = store
            .update_session(
                &created.id,
                SessionPatch {
                    expected_status: Some(SessionStatus::Paused),
                    label: Some("renamed".to_string()),
                    ..SessionPatch::default()
                },
            )
            .await;
        assert!(matches!(result, Err(InfraError::Conflict(_))));

        let missing = store
            .update_session("ses-missing", SessionPatch::default())
            .await;
        assert!(matches!(missing, Err(InfraError::NotFound(_))));
    }

    #[tokio::test]
    async fn sqlite_store_lists_only_open_sessions_started_before_cutoff() {
        let database = TempDatabase::new();
        let store = SqliteSessionStore::new(&database.path);
        let cutoff = fixed_time("2026-02-17T05:00:00Z");

        let stale = store
            .create_session(new_session("user-1", cutoff - Duration::hours(2)))
            .await
            .expect("stale session");
        store
            .create_session(new_session("user-2", cutoff + Duration::minutes(1)))
            .await
            .expect("fresh session");
        let finished = store
            .create_session(new_session("user-3", cutoff - Duration::hours(3)))
            .await
            .expect("finished session");
        store
            .update_session(
                &finished.id,
                SessionPatch {
                    state: Some(SessionState::Completed {
                        ended_at: cutoff - Duration::hours(1),
                        duration_seconds: 7200,
                    }),
                    ..SessionPatch::default()
                },
            )
            .await
            .expect("complete session");

        let listed = store
            .list_stale_open_sessions(cutoff)
            .await
            .expect("list stale sessions");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, stale.id);
    }

    #[tokio::test]
    async fn in_memory_store_matches_sqlite_open_session_rule() {
        let store = InMemorySessionStore::default();
        let started_at = fixed_time("2026-02-16T09:00:00Z");
        store
            .create_session(new_session("user-1", started_at))
            .await
            .expect("first session");
        let second = store.create_session(new_session("user-1", started_at)).await;
        assert!(matches!(second, Err(InfraError::Conflict(_))));
    }
}
