use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const APP_JSON: &str = "app.json";
const SYNC_JSON: &str = "sync.json";
const DEFAULT_CALENDAR_ID: &str = "primary";

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigBundle {
    pub app: serde_json::Value,
    pub sync: serde_json::Value,
}

/// Reconciler and scheduler settings read from `sync.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    #[serde(default = "default_auto_sync")]
    pub auto_sync: bool,
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,
    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: u64,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default = "default_lookahead_days")]
    pub lookahead_days: i64,
    #[serde(default = "default_calendar_ids")]
    pub calendar_ids: Vec<String>,
    #[serde(default = "default_calendar_id")]
    pub default_calendar_id: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            auto_sync: default_auto_sync(),
            interval_minutes: default_interval_minutes(),
            debounce_seconds: default_debounce_seconds(),
            lookback_days: default_lookback_days(),
            lookahead_days: default_lookahead_days(),
            calendar_ids: default_calendar_ids(),
            default_calendar_id: default_calendar_id(),
        }
    }
}

impl SyncSettings {
    pub fn validate(&self) -> Result<(), InfraError> {
        if self.interval_minutes == 0 {
            return Err(InfraError::InvalidConfig(
                "sync.intervalMinutes must be > 0".to_string(),
            ));
        }
        if self.lookback_days < 0 || self.lookahead_days < 0 {
            return Err(InfraError::InvalidConfig(
                "sync.lookbackDays and sync.lookaheadDays must not be negative".to_string(),
            ));
        }
        if self.default_calendar_id.trim().is_empty() {
            return Err(InfraError::InvalidConfig(
                "sync.defaultCalendarId must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Calendars pulled from, de-duplicated, with blanks dropped.
    pub fn enabled_calendar_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for id in self.calendar_ids.iter().map(|id| id.trim()) {
            if !id.is_empty() && !ids.iter().any(|existing| existing == id) {
                ids.push(id.to_string());
            }
        }
        if ids.is_empty() {
            ids.push(self.default_calendar_id.trim().to_string());
        }
        ids
    }
}

fn default_auto_sync() -> bool {
    true
}

fn default_interval_minutes() -> u64 {
    15
}

fn default_debounce_seconds() -> u64 {
    5
}

fn default_lookback_days() -> i64 {
    30
}

fn default_lookahead_days() -> i64 {
    60
}

fn default_calendar_ids() -> Vec<String> {
    vec![DEFAULT_CALENDAR_ID.to_string()]
}

fn default_calendar_id() -> String {
    DEFAULT_CALENDAR_ID.to_string()
}

fn default_files() -> HashMap<&'static str, serde_json::Value> {
    HashMap::from([
        (
            APP_JSON,
            serde_json::json!({
                "schema": 1,
                "appName": "TaskCal",
                "timezone": null
            }),
        ),
        (
            SYNC_JSON,
            serde_json::json!({
                "schema": 1,
                "autoSync": true,
                "intervalMinutes": 15,
                "debounceSeconds": 5,
                "lookbackDays": 30,
                "lookaheadDays": 60,
                "calendarIds": ["primary"],
                "defaultCalendarId": "primary"
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
        sync: read_config(&config_dir.join(SYNC_JSON))?,
    })
}

/// Configured IANA zone name; `None` means "use the machine's zone".
pub fn read_timezone(config_dir: &Path) -> Result<Option<String>, InfraError> {
    let app = read_config(&config_dir.join(APP_JSON))?;
    Ok(app
        .get("timezone")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned))
}

pub fn read_sync_settings(config_dir: &Path) -> Result<SyncSettings, InfraError> {
    let path = config_dir.join(SYNC_JSON);
    let raw = read_config(&path)?;
    let settings: SyncSettings = serde_json::from_value(raw).map_err(|error| {
        InfraError::InvalidConfig(format!("invalid {}: {error}", path.display()))
    })?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_DIR: AtomicUsize = AtomicUsize::new(0);

    struct TempConfigDir {
        path: PathBuf,
    }

    impl TempConfigDir {
        fn new() -> Self {
            let sequence = NEXT_TEMP_DIR.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "taskcal-config-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&path).expect("create temp config dir");
            Self { path }
        }
    }

    impl Drop for TempConfigDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn defaults_are_written_and_readable() {
        let dir = TempConfigDir::new();
        ensure_default_configs(&dir.path).expect("write defaults");

        let bundle = load_configs(&dir.path).expect("load configs");
        assert_eq!(bundle.app["appName"], serde_json::json!("TaskCal"));
        assert_eq!(read_timezone(&dir.path).expect("timezone"), None);
        assert_eq!(read_sync_settings(&dir.path).expect("sync"), SyncSettings::default());
    }

    #[test]
    fn existing_files_are_not_overwritten() {
        let dir = TempConfigDir::new();
        fs::write(
            dir.path.join(APP_JSON),
            r#"{"schema":1,"appName":"Mine","timezone":"Asia/Tokyo"}"#,
        )
        .expect("write app config");
        ensure_default_configs(&dir.path).expect("write defaults");
        assert_eq!(
            read_timezone(&dir.path).expect("timezone"),
            Some("Asia/Tokyo".to_string())
        );
    }

    #[test]
    fn unsupported_schema_is_rejected() {
        let dir = TempConfigDir::new();
        fs::write(dir.path.join(SYNC_JSON), r#"{"schema":2}"#).expect("write sync config");
        assert!(matches!(
            read_sync_settings(&dir.path),
            Err(InfraError::InvalidConfig(_))
        ));
    }

    #[test]
    fn partial_sync_config_falls_back_to_defaults() {
        let dir = TempConfigDir::new();
        fs::write(
            dir.path.join(SYNC_JSON),
            r#"{"schema":1,"intervalMinutes":5,"calendarIds":[" work ","work",""]}"#,
        )
        .expect("write sync config");
        let settings = read_sync_settings(&dir.path).expect("sync settings");
        assert_eq!(settings.interval_minutes, 5);
        assert_eq!(settings.debounce_seconds, 5);
        assert_eq!(settings.enabled_calendar_ids(), vec!["work".to_string()]);
    }

    #[test]
    fn zero_interval_is_invalid() {
        let settings = SyncSettings {
            interval_minutes: 0,
            ..SyncSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
