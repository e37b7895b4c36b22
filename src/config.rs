use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::AgentError;
use crate::platform::common::atomic_write;

/// Default polling interval when no jobs are pending
pub const DEFAULT_IDLE_INTERVAL_SECS: u64 = 30;

/// Default polling interval while jobs are pending
pub const DEFAULT_ACTIVE_INTERVAL_SECS: u64 = 5;

const STATE_DIR_NAME: &str = "CertHubAgent";

/// Agent configuration stored as `config.json`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default)]
    pub api_base_url: String,

    #[serde(default)]
    pub device_id: String,

    /// Web portal shown to operators; derived from the API URL when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portal_url: Option<String>,

    #[serde(default = "default_idle_interval")]
    pub polling_interval_seconds_idle: u64,

    #[serde(default = "default_active_interval")]
    pub polling_interval_seconds_active: u64,

    /// Local date of the last successful daily (scheduled or fallback) cleanup
    #[serde(
        default,
        deserialize_with = "deserialize_local_date",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_cleanup_local_date: Option<NaiveDate>,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_idle_interval() -> u64 {
    DEFAULT_IDLE_INTERVAL_SECS
}

fn default_active_interval() -> u64 {
    DEFAULT_ACTIVE_INTERVAL_SECS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AgentConfig {
    pub fn new(api_base_url: &str, device_id: &str) -> Self {
        Self {
            api_base_url: api_base_url.trim().to_string(),
            device_id: device_id.trim().to_string(),
            portal_url: None,
            polling_interval_seconds_idle: DEFAULT_IDLE_INTERVAL_SECS,
            polling_interval_seconds_active: DEFAULT_ACTIVE_INTERVAL_SECS,
            last_cleanup_local_date: None,
            log_level: default_log_level(),
        }
    }

    /// Load `config.json`; a missing file is `Ok(None)`
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: AgentConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(Some(config))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;

        atomic_write(path, content.as_bytes())
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Persist `date` as the last daily cleanup, keeping the rest of the file as is
    pub fn record_cleanup_date(path: &Path, date: NaiveDate) -> Result<()> {
        let mut config = Self::load(path)?.context("No configuration to update")?;
        config.last_cleanup_local_date = Some(date);
        config.save(path)
    }

    /// Check the fields the agent loop needs
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.api_base_url.trim().is_empty() {
            return Err(AgentError::ConfigInvalid("apiBaseUrl is not set".to_string()));
        }

        let url = Url::parse(self.api_base_url.trim())
            .map_err(|e| AgentError::ConfigInvalid(format!("apiBaseUrl is not a valid URL: {}", e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(AgentError::ConfigInvalid(format!(
                "apiBaseUrl must use http or https, got {}",
                url.scheme()
            )));
        }

        if self.device_id.trim().is_empty() {
            return Err(AgentError::ConfigInvalid("deviceId is not set".to_string()));
        }

        Ok(())
    }

    /// Active and idle intervals in seconds, clamped to at least 1s with idle ≥ active
    pub fn polling_intervals(&self) -> (u64, u64) {
        let active = self.polling_interval_seconds_active.max(1);
        let idle = self.polling_interval_seconds_idle.max(active);
        (active, idle)
    }

    /// Portal URL, falling back to the API base URL without its `/api/v1` suffix
    pub fn resolve_portal_url(&self) -> Option<String> {
        if let Some(portal) = self.portal_url.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            return Some(portal.to_string());
        }

        let api = Url::parse(self.api_base_url.trim()).ok()?;
        let base = api.as_str().trim_end_matches('/');
        let stripped = match base.len().checked_sub("/api/v1".len()) {
            Some(cut) if base[cut..].eq_ignore_ascii_case("/api/v1") => &base[..cut],
            _ => base,
        };
        Some(stripped.to_string())
    }
}

/// Accept `YYYY-MM-DD` as well as the datetime strings older agents wrote
fn deserialize_local_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_local_date))
}

pub fn parse_local_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|dt| dt.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

/// Locations of everything the agent keeps on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    root: PathBuf,
}

impl AgentPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Use `home` if given, otherwise the per-user local data directory
    pub fn resolve(home: Option<&Path>) -> Result<Self> {
        if let Some(home) = home {
            return Ok(Self::new(home.to_path_buf()));
        }

        let dirs = directories::ProjectDirs::from("", "", STATE_DIR_NAME)
            .context("Could not determine the local data directory")?;
        Ok(Self::new(dirs.data_local_dir().to_path_buf()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn secrets_file(&self) -> PathBuf {
        self.root.join("secrets.dat")
    }

    pub fn registry_file(&self) -> PathBuf {
        self.root.join("installed_thumbprints.json")
    }

    pub fn seal_key_file(&self) -> PathBuf {
        self.root.join("seal.key")
    }

    pub fn cert_store_dir(&self) -> PathBuf {
        self.root.join("certstore")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir().join("agent.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"apiBaseUrl":"https://h/api/v1","deviceId":"d"}"#).unwrap();

        assert_eq!(config.polling_interval_seconds_idle, 30);
        assert_eq!(config.polling_interval_seconds_active, 5);
        assert_eq!(config.log_level, "info");
        assert!(config.last_cleanup_local_date.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn legacy_datetime_cleanup_date_is_accepted() {
        let config: AgentConfig = serde_json::from_str(
            r#"{"apiBaseUrl":"https://h","deviceId":"d","lastCleanupLocalDate":"2024-05-01T00:00:00"}"#,
        )
        .unwrap();
        assert_eq!(
            config.last_cleanup_local_date,
            NaiveDate::from_ymd_opt(2024, 5, 1)
        );

        assert_eq!(parse_local_date("2024-05-02"), NaiveDate::from_ymd_opt(2024, 5, 2));
        assert_eq!(
            parse_local_date("2024-05-03T00:00:00+02:00"),
            NaiveDate::from_ymd_opt(2024, 5, 3)
        );
        assert_eq!(parse_local_date("yesterday"), None);
    }

    #[test]
    fn save_then_load_writes_camel_case() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AgentConfig::new("https://certhub.example.com/api/v1", "device-1");
        config.last_cleanup_local_date = NaiveDate::from_ymd_opt(2024, 6, 1);

        config.save(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"apiBaseUrl\""));
        assert!(raw.contains("\"lastCleanupLocalDate\": \"2024-06-01\""));
        assert_eq!(AgentConfig::load(&path).unwrap(), Some(config));
    }

    #[test]
    fn record_cleanup_date_updates_existing_file_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let date = NaiveDate::from_ymd_opt(2024, 7, 4).unwrap();
        assert!(AgentConfig::record_cleanup_date(&path, date).is_err());

        AgentConfig::new("https://h", "d").save(&path).unwrap();
        AgentConfig::record_cleanup_date(&path, date).unwrap();

        let config = AgentConfig::load(&path).unwrap().unwrap();
        assert_eq!(config.last_cleanup_local_date, Some(date));
        assert_eq!(config.device_id, "d");
    }

    #[test]
    fn missing_config_loads_none_and_garbage_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        assert!(AgentConfig::load(&path).unwrap().is_none());

        std::fs::write(&path, "{ not json").unwrap();
        assert!(AgentConfig::load(&path).is_err());
    }

    #[test]
    fn validate_rejects_incomplete_config() {
        let mut config = AgentConfig::new("", "device-1");
        assert!(matches!(config.validate(), Err(AgentError::ConfigInvalid(_))));

        config.api_base_url = "ftp://h".to_string();
        assert!(config.validate().is_err());

        config.api_base_url = "https://h".to_string();
        config.device_id = " ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn polling_intervals_are_clamped() {
        let mut config = AgentConfig::new("https://h", "d");
        config.polling_interval_seconds_active = 0;
        config.polling_interval_seconds_idle = 0;
        assert_eq!(config.polling_intervals(), (1, 1));

        config.polling_interval_seconds_active = 20;
        config.polling_interval_seconds_idle = 10;
        assert_eq!(config.polling_intervals(), (20, 20));
    }

    #[test]
    fn portal_url_strips_api_suffix() {
        let mut config = AgentConfig::new("https://certhub.example.com/API/v1/", "d");
        assert_eq!(
            config.resolve_portal_url().as_deref(),
            Some("https://certhub.example.com")
        );

        config.api_base_url = "https://certhub.example.com/custom".to_string();
        assert_eq!(
            config.resolve_portal_url().as_deref(),
            Some("https://certhub.example.com/custom")
        );

        config.portal_url = Some("https://portal.example.com".to_string());
        assert_eq!(
            config.resolve_portal_url().as_deref(),
            Some("https://portal.example.com")
        );

        let empty = AgentConfig::new("", "d");
        assert_eq!(empty.resolve_portal_url(), None);
    }

    #[test]
    fn paths_live_under_home_override() {
        let paths = AgentPaths::resolve(Some(Path::new("/tmp/certhub"))).unwrap();
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/certhub/config.json"));
        assert_eq!(paths.log_file(), PathBuf::from("/tmp/certhub/logs/agent.log"));
        assert_eq!(paths.cert_store_dir(), PathBuf::from("/tmp/certhub/certstore"));
    }
}
