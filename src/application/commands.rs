use crate::application::bootstrap::bootstrap_workspace;
use crate::application::error::SessionError;
use crate::application::mode_cycle::{CycleOutcome, ModeCycleController};
use crate::application::rollover::{RolloverService, ScheduledRolloverResult};
use crate::application::session_service::{SessionService, StartOrigin};
use crate::application::watchdog::{WatchdogEvent, WatchdogRegistry};
use crate::domain::models::{SessionMode, SessionView, TimerPolicy};
use crate::infrastructure::config::{
    load_rollover_secret_from_env, load_timer_policy, read_listen_address, read_reference_timezone,
};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::profile_repository::SqliteProfileRepository;
use crate::infrastructure::session_store::SqliteSessionStore;
use chrono::Utc;
use chrono_tz::Tz;
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

type Sessions = SessionService<SqliteSessionStore, SqliteProfileRepository>;

pub struct AppState {
    config_dir: PathBuf,
    database_path: PathBuf,
    logs_dir: PathBuf,
    listen_address: String,
    rollover_secret: Option<String>,
    sessions: Sessions,
    cycle: ModeCycleController<SqliteSessionStore, SqliteProfileRepository>,
    rollover: RolloverService<SqliteSessionStore, SqliteProfileRepository>,
    watchdogs: WatchdogRegistry,
    log_guard: Mutex<()>,
}

impl AppState {
    pub fn new(workspace_root: PathBuf) -> Result<Self, InfraError> {
        let bootstrap = bootstrap_workspace(&workspace_root)?;
        let config_dir = workspace_root.join("config");
        let logs_dir = workspace_root.join("logs");

        let timezone = read_reference_timezone(&config_dir)?;
        let listen_address = read_listen_address(&config_dir)?;
        let policy = load_timer_policy(&config_dir);

        Ok(Self::with_services(
            config_dir,
            bootstrap.database_path,
            logs_dir,
            listen_address,
            timezone,
            policy,
        )
        .with_rollover_secret(load_rollover_secret_from_env()))
    }

    fn with_services(
        config_dir: PathBuf,
        database_path: PathBuf,
        logs_dir: PathBuf,
        listen_address: String,
        timezone: Tz,
        policy: TimerPolicy,
    ) -> Self {
        let sessions = SessionService::new(
            Arc::new(SqliteSessionStore::new(&database_path)),
            Arc::new(SqliteProfileRepository::new(&database_path)),
        )
        .with_policy(policy);

        Self {
            config_dir,
            database_path,
            logs_dir,
            listen_address,
            rollover_secret: None,
            cycle: ModeCycleController::new(sessions.clone()),
            rollover: RolloverService::new(sessions.clone(), timezone),
            sessions,
            watchdogs: WatchdogRegistry::default(),
            log_guard: Mutex::new(()),
        }
    }

    pub fn with_rollover_secret(mut self, secret: Option<String>) -> Self {
        self.rollover_secret = secret.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn listen_address(&self) -> &str {
        &self.listen_address
    }

    pub fn command_error(&self, command: &str, error: SessionError) -> CommandError {
        self.log_error(command, &error.to_string());
        CommandError::from(error)
    }

    pub fn log_info(&self, command: &str, message: &str) {
        self.append_log("info", command, message);
    }

    pub fn log_error(&self, command: &str, message: &str) {
        self.append_log("error", command, message);
    }

    fn append_log(&self, level: &str, command: &str, message: &str) {
        let Ok(_guard) = self.log_guard.lock() else {
            return;
        };
        let path = self.logs_dir.join("commands.log");
        let payload = serde_json::json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level,
            "command": command,
            "message": message,
        });

        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{}", payload);
        }
    }
}

/// Error body returned to HTTP callers.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CommandError {
    pub ok: bool,
    pub error: &'static str,
    pub message: String,
}

impl From<SessionError> for CommandError {
    fn from(error: SessionError) -> Self {
        Self {
            ok: false,
            error: error.code(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CompleteSessionResponse {
    pub ended: SessionView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<SessionView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatResponse {
    pub current: Option<SessionView>,
    pub events: Vec<WatchdogEvent>,
    pub next_poll_seconds: i64,
}

pub async fn get_current_session_impl(
    state: &AppState,
    owner: String,
) -> Result<Option<SessionView>, SessionError> {
    let now = Utc::now();
    Ok(state
        .sessions
        .current(&owner)
        .await?
        .map(|session| state.sessions.view(session, now)))
}

pub async fn start_session_impl(
    state: &AppState,
    owner: String,
    label: String,
    mode: Option<String>,
) -> Result<SessionView, SessionError> {
    let mode = parse_mode_input(mode.as_deref())?;
    let now = Utc::now();
    let session = state
        .sessions
        .start(&owner, &label, mode, StartOrigin::User, now)
        .await?;
    state.log_info(
        "start_session",
        &format!("owner={} session={} mode={}", session.owner, session.id, mode.as_str()),
    );
    Ok(state.sessions.view(session, now))
}

pub async fn pause_session_impl(
    state: &AppState,
    owner: String,
    session_id: String,
) -> Result<SessionView, SessionError> {
    let now = Utc::now();
    let session = state.sessions.pause(&owner, &session_id, now).await?;
    Ok(state.sessions.view(session, now))
}

pub async fn resume_session_impl(
    state: &AppState,
    owner: String,
    session_id: String,
) -> Result<SessionView, SessionError> {
    let now = Utc::now();
    let session = state.sessions.resume(&owner, &session_id, now).await?;
    Ok(state.sessions.view(session, now))
}

pub async fn stop_session_impl(
    state: &AppState,
    owner: String,
    session_id: String,
) -> Result<SessionView, SessionError> {
    let now = Utc::now();
    let session = state.sessions.stop(&owner, &session_id, now).await?;
    state.log_info(
        "stop_session",
        &format!("owner={} session={}", session.owner, session.id),
    );
    Ok(state.sessions.view(session, now))
}

pub async fn rename_session_impl(
    state: &AppState,
    owner: String,
    session_id: String,
    label: String,
) -> Result<SessionView, SessionError> {
    let session = state.sessions.rename(&owner, &session_id, &label).await?;
    Ok(state.sessions.view(session, Utc::now()))
}

pub async fn complete_session_impl(
    state: &AppState,
    owner: String,
    session_id: String,
) -> Result<CompleteSessionResponse, SessionError> {
    let now = Utc::now();
    let response = match state.cycle.complete_timed(&owner, &session_id, now).await? {
        CycleOutcome::Started {
            ended,
            next,
            loop_count,
        } => CompleteSessionResponse {
            ended: state.sessions.view(ended, now),
            next: Some(state.sessions.view(next, now)),
            loop_count: Some(loop_count),
        },
        CycleOutcome::Stopped { ended } => CompleteSessionResponse {
            ended: state.sessions.view(ended, now),
            next: None,
            loop_count: None,
        },
    };
    Ok(response)
}

pub async fn heartbeat_impl(
    state: &AppState,
    owner: String,
) -> Result<HeartbeatResponse, SessionError> {
    let owner = owner.trim().to_string();
    if owner.is_empty() {
        return Err(SessionError::Validation("owner must not be empty".to_string()));
    }

    let now = Utc::now();
    let handle = state.watchdogs.checkout(&owner, now);
    let mut watchdog = handle.lock().await;
    let events = watchdog.tick(&state.sessions, &state.rollover, now).await?;
    let next_poll_seconds = watchdog.next_poll_delay(&state.rollover, now).num_seconds();
    drop(watchdog);

    for event in &events {
        match event {
            WatchdogEvent::SessionRolledOver { outcome } => state.log_info(
                "heartbeat",
                &format!("owner={owner} rolled_over={}", outcome.closed.id),
            ),
            WatchdogEvent::PausedSessionExpired { session } => state.log_info(
                "heartbeat",
                &format!("owner={owner} paused_expired={}", session.id),
            ),
        }
    }

    let current = state
        .sessions
        .current(&owner)
        .await?
        .map(|session| state.sessions.view(session, now));
    Ok(HeartbeatResponse {
        current,
        events,
        next_poll_seconds,
    })
}

pub async fn scheduled_rollover_impl(
    state: &AppState,
    authorization: Option<String>,
) -> Result<ScheduledRolloverResult, SessionError> {
    let result = state
        .rollover
        .run_scheduled(
            state.rollover_secret.as_deref(),
            authorization.as_deref(),
            Utc::now(),
        )
        .await?;

    match &result {
        ScheduledRolloverResult::Unauthorized => {
            state.log_error("scheduled_rollover", "unauthorized call rejected")
        }
        ScheduledRolloverResult::Skipped { local_time } => state.log_info(
            "scheduled_rollover",
            &format!("skipped outside window at {local_time}"),
        ),
        ScheduledRolloverResult::Completed { report } => state.log_info(
            "scheduled_rollover",
            &format!(
                "matched={} closed={} continued={} failed={}",
                report.matched, report.closed, report.continued, report.failed
            ),
        ),
    }
    Ok(result)
}

fn parse_mode_input(value: Option<&str>) -> Result<SessionMode, SessionError> {
    match value.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(SessionMode::Stopwatch),
        Some(raw) => SessionMode::parse(raw)
            .ok_or_else(|| SessionError::Validation(format!("unsupported mode: {raw}"))),
    }
}
