use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Retention policy attached to an installed certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetentionMode {
    /// Removed by the next cleanup run
    #[default]
    Default,
    /// Kept until `keep_until`, then removed
    KeepUntil,
    /// Never removed automatically
    Exempt,
}

impl RetentionMode {
    /// Parse a wire value; missing or unrecognized values mean `Default`
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_uppercase()).as_deref() {
            Some("KEEP_UNTIL") => RetentionMode::KeepUntil,
            Some("EXEMPT") => RetentionMode::Exempt,
            _ => RetentionMode::Default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionMode::Default => "DEFAULT",
            RetentionMode::KeepUntil => "KEEP_UNTIL",
            RetentionMode::Exempt => "EXEMPT",
        }
    }
}

impl fmt::Display for RetentionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RetentionMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(RetentionMode::parse(raw.as_deref()))
    }
}

/// Canonical thumbprint: hex digits only, uppercase
pub fn canonical_thumbprint(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// One certificate the agent installed, with its retention policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledThumbprintEntry {
    pub thumbprint: String,

    #[serde(default, alias = "job_id")]
    pub job_id: Option<String>,

    #[serde(default, alias = "cleanup_mode")]
    pub cleanup_mode: RetentionMode,

    #[serde(default, alias = "keep_until")]
    pub keep_until: Option<DateTime<Utc>>,

    #[serde(default, alias = "keep_reason")]
    pub keep_reason: Option<String>,

    #[serde(default, alias = "installed_at")]
    pub installed_at: Option<DateTime<Utc>>,
}

impl InstalledThumbprintEntry {
    /// Lift a bare thumbprint from the legacy flat-list format
    pub fn legacy(thumbprint: &str) -> Self {
        Self {
            thumbprint: thumbprint.to_string(),
            job_id: None,
            cleanup_mode: RetentionMode::Default,
            keep_until: None,
            keep_reason: None,
            installed_at: None,
        }
    }

    pub fn canonical_thumbprint(&self) -> String {
        canonical_thumbprint(&self.thumbprint)
    }
}
