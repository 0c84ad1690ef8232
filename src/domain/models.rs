use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SessionMode {
    Stopwatch,
    Pomo,
    ShortBreak,
    LongBreak,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopwatch => "stopwatch",
            Self::Pomo => "pomo",
            Self::ShortBreak => "short-break",
            Self::LongBreak => "long-break",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stopwatch" => Some(Self::Stopwatch),
            "pomo" => Some(Self::Pomo),
            "short-break" | "short_break" => Some(Self::ShortBreak),
            "long-break" | "long_break" => Some(Self::LongBreak),
            _ => None,
        }
    }

    /// Timed modes end on their own when the countdown reaches zero.
    pub fn is_timed(self) -> bool {
        !matches!(self, Self::Stopwatch)
    }

    pub fn target_seconds(self, policy: &TimerPolicy) -> Option<i64> {
        let minutes = match self {
            Self::Stopwatch => return None,
            Self::Pomo => policy.pomo_minutes,
            Self::ShortBreak => policy.short_break_minutes,
            Self::LongBreak => policy.long_break_minutes,
        };
        Some(i64::from(minutes) * 60)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn is_open(self) -> bool {
        !matches!(self, Self::Completed)
    }
}

/// Lifecycle state of a session together with the timestamps that are only
/// meaningful in that state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionState {
    Active {
        last_resumed_at: DateTime<Utc>,
    },
    Paused {
        paused_at: DateTime<Utc>,
    },
    Completed {
        ended_at: DateTime<Utc>,
        duration_seconds: i64,
    },
}

impl SessionState {
    pub fn status(&self) -> SessionStatus {
        match self {
            Self::Active { .. } => SessionStatus::Active,
            Self::Paused { .. } => SessionStatus::Paused,
            Self::Completed { .. } => SessionStatus::Completed,
        }
    }

    pub fn last_resumed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Active { last_resumed_at } => Some(*last_resumed_at),
            _ => None,
        }
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Completed { ended_at, .. } => Some(*ended_at),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub owner: String,
    pub label: String,
    pub mode: SessionMode,
    pub started_at: DateTime<Utc>,
    pub accumulated_seconds: i64,
    pub state: SessionState,
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        self.state.status()
    }

    pub fn is_open(&self) -> bool {
        self.status().is_open()
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_non_empty(&self.id, "session.id")?;
        validate_non_empty(&self.owner, "session.owner")?;
        validate_non_empty(&self.label, "session.label")?;
        if self.accumulated_seconds < 0 {
            return Err("session.accumulated_seconds must be >= 0".to_string());
        }
        if let SessionState::Completed {
            ended_at,
            duration_seconds,
        } = self.state
        {
            if ended_at < self.started_at {
                return Err("session.ended_at must be >= session.started_at".to_string());
            }
            if duration_seconds < 0 {
                return Err("session.duration_seconds must be >= 0".to_string());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProfileStatus {
    Active,
    Paused,
    Idle,
}

impl ProfileStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Idle => "idle",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimerPolicy {
    pub pomo_minutes: u32,
    pub short_break_minutes: u32,
    pub long_break_minutes: u32,
    pub long_break_every: u32,
    pub cycle_reset_gap_minutes: u32,
    pub paused_expiry_minutes: u32,
    pub max_segment_hours: u32,
    pub rollover_window_minutes: u32,
    pub midnight_margin_minutes: u32,
}

impl Default for TimerPolicy {
    fn default() -> Self {
        Self {
            pomo_minutes: 25,
            short_break_minutes: 5,
            long_break_minutes: 15,
            long_break_every: 4,
            cycle_reset_gap_minutes: 30,
            paused_expiry_minutes: 60,
            max_segment_hours: 12,
            rollover_window_minutes: 60,
            midnight_margin_minutes: 10,
        }
    }
}

impl TimerPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.pomo_minutes == 0 {
            return Err("policy.pomo_minutes must be > 0".to_string());
        }
        if self.short_break_minutes == 0 || self.long_break_minutes == 0 {
            return Err("policy break durations must be > 0".to_string());
        }
        if self.long_break_every == 0 {
            return Err("policy.long_break_every must be > 0".to_string());
        }
        if self.max_segment_hours == 0 {
            return Err("policy.max_segment_hours must be > 0".to_string());
        }
        if self.rollover_window_minutes == 0 || self.rollover_window_minutes > 24 * 60 {
            return Err("policy.rollover_window_minutes must be within 1..=1440".to_string());
        }
        Ok(())
    }

    pub fn max_segment_seconds(&self) -> i64 {
        i64::from(self.max_segment_hours) * 3600
    }

    pub fn cycle_reset_gap(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.cycle_reset_gap_minutes))
    }

    pub fn paused_expiry(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.paused_expiry_minutes))
    }

    pub fn rollover_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.rollover_window_minutes))
    }

    pub fn midnight_margin(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.midnight_margin_minutes))
    }
}

/// Display projection of a session at a given instant.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionView {
    pub session: Session,
    pub elapsed_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_seconds: Option<i64>,
}

/// Trims a user supplied label, rejecting blank input.
pub fn normalize_label(value: &str, field_name: &str) -> Result<String, String> {
    validate_non_empty(value, field_name)?;
    Ok(value.trim().to_string())
}

fn validate_non_empty(value: &str, field_name: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{field_name} must not be empty"));
    }
    Ok(())
}
