use crate::domain::models::TimerPolicy;
use crate::infrastructure::error::InfraError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const APP_JSON: &str = "app.json";
const TIMER_JSON: &str = "timer.json";
const DEFAULT_REFERENCE_TIMEZONE: &str = "America/New_York";
const DEFAULT_LISTEN: &str = "127.0.0.1:8787";
const ROLLOVER_SECRET_KEYS: [&str; 2] = ["LOCKED_IN_ROLLOVER_SECRET", "CRON_SECRET"];

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBundle {
    pub app: serde_json::Value,
    pub timer: serde_json::Value,
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    let policy = TimerPolicy::default();
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "appName": "locked-in factory",
                "referenceTimezone": DEFAULT_REFERENCE_TIMEZONE,
                "listen": DEFAULT_LISTEN
            }),
        ),
        (
            TIMER_JSON,
            serde_json::json!({
                "schema": 1,
                "pomoMinutes": policy.pomo_minutes,
                "shortBreakMinutes": policy.short_break_minutes,
                "longBreakMinutes": policy.long_break_minutes,
                "longBreakEvery": policy.long_break_every,
                "cycleResetGapMinutes": policy.cycle_reset_gap_minutes,
                "pausedExpiryMinutes": policy.paused_expiry_minutes,
                "maxSegmentHours": policy.max_segment_hours,
                "rolloverWindowMinutes": policy.rollover_window_minutes,
                "midnightMarginMinutes": policy.midnight_margin_minutes
            }),
        ),
    ])
}

pub fn ensure_default_configs(config_dir: &Path) -> Result<(), InfraError> {
    for (name, value) in default_files() {
        let path = config_dir.join(name);
        if !path.exists() {
            let formatted = serde_json::to_string_pretty(&value)?;
            fs::write(path, format!("{formatted}\n"))?;
        }
    }
    Ok(())
}

fn read_config(path: &Path) -> Result<serde_json::Value, InfraError> {
    let raw = fs::read_to_string(path)?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;
    let schema = parsed
        .get("schema")
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| InfraError::InvalidConfig(format!("missing schema in {}", path.display())))?;
    if schema != 1 {
        return Err(InfraError::InvalidConfig(format!(
            "unsupported schema {} in {}",
            schema,
            path.display()
        )));
    }
    Ok(parsed)
}

pub fn load_configs(config_dir: &Path) -> Result<ConfigBundle, InfraError> {
    Ok(ConfigBundle {
        app: read_config(&config_dir.join(APP_JSON))?,
        timer: read_config(&config_dir.join(TIMER_JSON))?,
    })
}

fn read_app_string(config_dir: &Path, key: &str) -> Result<Option<String>, InfraError> {
    let app = read_config(&config_dir.join(APP_JSON))?;
    Ok(app
        .get(key)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned))
}

pub fn read_reference_timezone(config_dir: &Path) -> Result<Tz, InfraError> {
    let name = read_app_string(config_dir, "referenceTimezone")?
        .unwrap_or_else(|| DEFAULT_REFERENCE_TIMEZONE.to_string());
    name.parse::<Tz>()
        .map_err(|error| InfraError::InvalidConfig(format!("invalid referenceTimezone '{name}': {error}")))
}

pub fn read_listen_address(config_dir: &Path) -> Result<String, InfraError> {
    Ok(read_app_string(config_dir, "listen")?.unwrap_or_else(|| DEFAULT_LISTEN.to_string()))
}

/// Loads the timer policy, keeping the default for any missing or invalid field.
pub fn load_timer_policy(config_dir: &Path) -> TimerPolicy {
    let mut policy = TimerPolicy::default();
    let Ok(timer) = read_config(&config_dir.join(TIMER_JSON)) else {
        return policy;
    };

    let read_u32 = |key: &str| {
        timer
            .get(key)
            .and_then(serde_json::Value::as_u64)
            .and_then(|value| u32::try_from(value).ok())
    };

    let candidate = TimerPolicy {
        pomo_minutes: read_u32("pomoMinutes").unwrap_or(policy.pomo_minutes),
        short_break_minutes: read_u32("shortBreakMinutes").unwrap_or(policy.short_break_minutes),
        long_break_minutes: read_u32("longBreakMinutes").unwrap_or(policy.long_break_minutes),
        long_break_every: read_u32("longBreakEvery").unwrap_or(policy.long_break_every),
        cycle_reset_gap_minutes: read_u32("cycleResetGapMinutes")
            .unwrap_or(policy.cycle_reset_gap_minutes),
        paused_expiry_minutes: read_u32("pausedExpiryMinutes")
            .unwrap_or(policy.paused_expiry_minutes),
        max_segment_hours: read_u32("maxSegmentHours").unwrap_or(policy.max_segment_hours),
        rollover_window_minutes: read_u32("rolloverWindowMinutes")
            .unwrap_or(policy.rollover_window_minutes),
        midnight_margin_minutes: read_u32("midnightMarginMinutes")
            .unwrap_or(policy.midnight_margin_minutes),
    };
    if candidate.validate().is_ok() {
        policy = candidate;
    }
    policy
}

pub fn load_rollover_secret_from_env() -> Option<String> {
    load_rollover_secret_from_lookup(|key| std::env::var(key).ok())
}

pub fn load_rollover_secret_from_lookup<F>(lookup: F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    ROLLOVER_SECRET_KEYS.iter().find_map(|key| {
        lookup(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    struct TempConfigDir {
        path: PathBuf,
    }

    impl TempConfigDir {
        fn new(name: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "locked-in-config-tests-{}-{name}",
                std::process::id()
            ));
            fs::create_dir_all(&path).expect("create config dir");
            Self { path }
        }
    }

    impl Drop for TempConfigDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn default_configs_load_with_schema_one() {
        let dir = TempConfigDir::new("defaults");
        ensure_default_configs(&dir.path).expect("write defaults");
        let bundle = load_configs(&dir.path).expect("load configs");
        assert_eq!(bundle.app["referenceTimezone"], DEFAULT_REFERENCE_TIMEZONE);
        assert_eq!(
            read_reference_timezone(&dir.path).expect("timezone"),
            chrono_tz::America::New_York
        );
        assert_eq!(load_timer_policy(&dir.path), TimerPolicy::default());
    }

    #[test]
    fn unsupported_schema_is_rejected() {
        let dir = TempConfigDir::new("schema");
        fs::write(dir.path.join(APP_JSON), "{\"schema\": 2}").expect("write app config");
        assert!(matches!(
            read_reference_timezone(&dir.path),
            Err(InfraError::InvalidConfig(_))
        ));
    }

    #[test]
    fn invalid_timer_values_fall_back_to_defaults() {
        let dir = TempConfigDir::new("timer");
        ensure_default_configs(&dir.path).expect("write defaults");
        fs::write(
            dir.path.join(TIMER_JSON),
            "{\"schema\": 1, \"longBreakEvery\": 0, \"pomoMinutes\": 50}",
        )
        .expect("write timer config");
        assert_eq!(load_timer_policy(&dir.path), TimerPolicy::default());

        fs::write(
            dir.path.join(TIMER_JSON),
            "{\"schema\": 1, \"pomoMinutes\": 50, \"maxSegmentHours\": 6}",
        )
        .expect("write timer config");
        let policy = load_timer_policy(&dir.path);
        assert_eq!(policy.pomo_minutes, 50);
        assert_eq!(policy.max_segment_hours, 6);
        assert_eq!(policy.long_break_every, 4);
    }

    #[test]
    fn rollover_secret_prefers_dedicated_key() {
        let secret = load_rollover_secret_from_lookup(|key| match key {
            "LOCKED_IN_ROLLOVER_SECRET" => Some("  primary ".to_string()),
            "CRON_SECRET" => Some("fallback".to_string()),
            _ => None,
        });
        assert_eq!(secret.as_deref(), Some("primary"));

        let fallback = load_rollover_secret_from_lookup(|key| match key {
            "LOCKED_IN_ROLLOVER_SECRET" => Some("   ".to_string()),
            "CRON_SECRET" => Some("fallback".to_string()),
            _ => None,
        });
        assert_eq!(fallback.as_deref(), Some("fallback"));
        assert_eq!(load_rollover_secret_from_lookup(|_| None), None);
    }
}
