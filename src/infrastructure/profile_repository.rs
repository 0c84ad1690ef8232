use crate::domain::models::ProfileStatus;
use crate::infrastructure::error::InfraError;
use crate::infrastructure::session_store::format_timestamp;
use crate::infrastructure::storage::open_connection;
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Denormalized status shown on the owner's profile.
#[async_trait]
pub trait ProfileMirror: Send + Sync {
    async fn set_status(
        &self,
        owner: &str,
        status: ProfileStatus,
        label: Option<&str>,
    ) -> Result<(), InfraError>;
}

/// Rolling count of completed pomos used to pick short or long breaks.
#[async_trait]
pub trait LoopCounter: Send + Sync {
    async fn get_count(&self, owner: &str) -> Result<u32, InfraError>;
    async fn set_count(&self, owner: &str, count: u32) -> Result<(), InfraError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRecord {
    pub current_status: ProfileStatus,
    pub current_task: Option<String>,
    pub pomo_loop_count: u32,
}

impl Default for ProfileRecord {
    fn default() -> Self {
        Self {
            current_status: ProfileStatus::Idle,
            current_task: None,
            pomo_loop_count: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteProfileRepository {
    db_path: PathBuf,
}

impl SqliteProfileRepository {
    pub fn new(db_path: impl AsRef<Path>) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    fn connect(&self) -> Result<Connection, InfraError> {
        open_connection(&self.db_path)
    }
}

#[async_trait]
impl ProfileMirror for SqliteProfileRepository {
    async fn set_status(
        &self,
        owner: &str,
        status: ProfileStatus,
        label: Option<&str>,
    ) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO profiles (owner, current_status, current_task, status_updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(owner) DO UPDATE SET
               current_status = excluded.current_status,
               current_task = excluded.current_task,
               status_updated_at = excluded.status_updated_at",
            params![owner, status.as_str(), label, format_timestamp(Utc::now())],
        )?;
        Ok(())
    }
}

#[async_trait]
impl LoopCounter for SqliteProfileRepository {
    async fn get_count(&self, owner: &str) -> Result<u32, InfraError> {
        let connection = self.connect()?;
        let count: Option<i64> = connection
            .query_row(
                "SELECT pomo_loop_count FROM profiles WHERE owner = ?1",
                params![owner],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(0))
    }

    async fn set_count(&self, owner: &str, count: u32) -> Result<(), InfraError> {
        let connection = self.connect()?;
        connection.execute(
            "INSERT INTO profiles (owner, pomo_loop_count)
             VALUES (?1, ?2)
             ON CONFLICT(owner) DO UPDATE SET pomo_loop_count = excluded.pomo_loop_count",
            params![owner, count],
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryProfileRepository {
    profiles: Mutex<HashMap<String, ProfileRecord>>,
}

impl InMemoryProfileRepository {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, ProfileRecord>>, InfraError> {
        self.profiles
            .lock()
            .map_err(|error| InfraError::InvalidConfig(format!("profile lock poisoned: {error}")))
    }

    pub fn profile(&self, owner: &str) -> Result<ProfileRecord, InfraError> {
        Ok(self.lock()?.get(owner).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ProfileMirror for InMemoryProfileRepository {
    async fn set_status(
        &self,
        owner: &str,
        status: ProfileStatus,
        label: Option<&str>,
    ) -> Result<(), InfraError> {
        let mut profiles = self.lock()?;
        let profile = profiles.entry(owner.to_string()).or_default();
        profile.current_status = status;
        profile.current_task = label.map(ToOwned::to_owned);
        Ok(())
    }
}

#[async_trait]
impl LoopCounter for InMemoryProfileRepository {
    async fn get_count(&self, owner: &str) -> Result<u32, InfraError> {
        Ok(self.profile(owner)?.pomo_loop_count)
    }

    async fn set_count(&self, owner: &str, count: u32) -> Result<(), InfraError> {
        self.lock()?
            .entry(owner.to_string())
            .or_default()
            .pomo_loop_count = count;
        Ok(())
    }
}
