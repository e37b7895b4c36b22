use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use super::api::{AgentApi, CleanupReport};
use crate::error::AgentError;
use crate::platform::trust_store::TrustStore;
use crate::retention::{InstalledThumbprintEntry, RetentionMode, RetentionStore};

/// What triggered a cleanup run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum CleanupMode {
    /// Daily 18:00 task
    Scheduled,
    /// Agent noticed the daily run was missed
    Fallback,
    /// Started by an operator
    Manual,
    /// One-shot task for expired KEEP_UNTIL certificates
    #[value(name = "keep_until")]
    KeepUntil,
}

impl CleanupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupMode::Scheduled => "scheduled",
            CleanupMode::Fallback => "fallback",
            CleanupMode::Manual => "manual",
            CleanupMode::KeepUntil => "keep_until",
        }
    }

    /// Whether a successful run counts as today's daily cleanup
    pub fn records_daily_run(&self) -> bool {
        matches!(self, CleanupMode::Scheduled | CleanupMode::Fallback)
    }
}

impl fmt::Display for CleanupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one cleanup run
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupResult {
    pub mode: CleanupMode,
    pub ran_at: DateTime<Utc>,
    pub total_in_scope: usize,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

impl CleanupResult {
    fn new(mode: CleanupMode, ran_at: DateTime<Utc>) -> Self {
        Self {
            mode,
            ran_at,
            total_in_scope: 0,
            removed: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        }
    }

    pub fn success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Per-entry verdict for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    OutOfScope,
    Skip(SkipReason),
    Eligible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Exempt,
    MissingKeepUntil,
    NotExpired,
}

/// Decide what a run in `mode` at `now` does with `entry`
pub fn decide(entry: &InstalledThumbprintEntry, mode: CleanupMode, now: DateTime<Utc>) -> Decision {
    if mode == CleanupMode::KeepUntil && entry.cleanup_mode != RetentionMode::KeepUntil {
        return Decision::OutOfScope;
    }

    match entry.cleanup_mode {
        RetentionMode::Exempt => Decision::Skip(SkipReason::Exempt),
        RetentionMode::KeepUntil => match entry.keep_until {
            None => Decision::Skip(SkipReason::MissingKeepUntil),
            Some(bound) if now < bound => Decision::Skip(SkipReason::NotExpired),
            Some(_) => Decision::Eligible,
        },
        RetentionMode::Default => Decision::Eligible,
    }
}

/// Post the cleanup audit record; failures are only logged
pub async fn report_cleanup(api: &AgentApi, result: &CleanupResult) {
    match api.report_cleanup(&CleanupReport::from(result)).await {
        Ok(()) => tracing::debug!("Cleanup audit sent"),
        Err(e) => tracing::warn!("Cleanup audit failed: {}", e),
    }
}

/// Removes agent-installed certificates whose retention has lapsed
pub struct CleanupEngine {
    registry: RetentionStore,
    trust_store: Arc<dyn TrustStore>,
}

impl CleanupEngine {
    pub fn new(registry: RetentionStore, trust_store: Arc<dyn TrustStore>) -> Self {
        Self {
            registry,
            trust_store,
        }
    }

    pub fn run(&self, mode: CleanupMode) -> Result<CleanupResult> {
        self.run_at(mode, Utc::now())
    }

    /// Run cleanup as of `now`.
    ///
    /// Individual removal failures are recorded in the result; only a failure
    /// to persist the remaining registry is returned as an error.
    pub fn run_at(&self, mode: CleanupMode, now: DateTime<Utc>) -> Result<CleanupResult> {
        tracing::info!("Cleanup started (mode: {})", mode);

        let entries = self.registry.load_normalized();
        let mut result = CleanupResult::new(mode, now);
        let mut remaining = Vec::with_capacity(entries.len());

        for entry in entries {
            match decide(&entry, mode, now) {
                Decision::OutOfScope => remaining.push(entry),
                Decision::Skip(reason) => {
                    result.total_in_scope += 1;
                    match reason {
                        SkipReason::MissingKeepUntil => tracing::warn!(
                            "Certificate {} is KEEP_UNTIL without a bound; keeping it",
                            entry.thumbprint
                        ),
                        _ => tracing::debug!("Keeping {} ({:?})", entry.thumbprint, reason),
                    }
                    result.skipped.push(entry.thumbprint.clone());
                    remaining.push(entry);
                }
                Decision::Eligible => {
                    result.total_in_scope += 1;
                    match self.remove_certificate(&entry.thumbprint) {
                        Ok(()) => result.removed.push(entry.thumbprint.clone()),
                        Err(e) => {
                            tracing::warn!("{}", e);
                            result.failed.push(entry.thumbprint.clone());
                            remaining.push(entry);
                        }
                    }
                }
            }
        }

        self.registry
            .save(&remaining)
            .context("Failed to persist installed thumbprints after cleanup")?;

        tracing::info!(
            "Cleanup finished (mode: {}). In scope: {}, removed: {}, skipped: {}, failed: {}",
            mode,
            result.total_in_scope,
            result.removed.len(),
            result.skipped.len(),
            result.failed.len()
        );

        Ok(result)
    }

    /// Remove every store certificate matching `thumbprint`; absent counts as removed
    fn remove_certificate(&self, thumbprint: &str) -> Result<(), AgentError> {
        let failure = |e: anyhow::Error| AgentError::CleanupFailure {
            thumbprint: thumbprint.to_string(),
            message: format!("{:#}", e),
        };

        let matches = self.trust_store.find(thumbprint).map_err(failure)?;
        if matches.is_empty() {
            tracing::info!("Certificate {} already absent from the store", thumbprint);
            return Ok(());
        }

        for certificate in &matches {
            self.trust_store.remove(certificate).map_err(failure)?;
        }
        tracing::info!("Removed certificate {}", thumbprint);
        Ok(())
    }
}
