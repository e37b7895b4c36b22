use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use super::api::AgentApi;
use crate::platform::trust_store::TrustStore;
use crate::retention::{InstalledThumbprintEntry, RetentionStore};

/// One certificate in the installed-certs snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstalledCertItem {
    pub thumbprint: String,
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub installed_via_agent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstalledCertsReport {
    pub device_id: String,
    pub items: Vec<InstalledCertItem>,
}

/// Join the trust store with the retention registry
pub fn build_snapshot(
    device_id: &str,
    trust_store: &dyn TrustStore,
    registry: &RetentionStore,
) -> Result<InstalledCertsReport> {
    let entries: HashMap<String, InstalledThumbprintEntry> = registry
        .load_normalized()
        .into_iter()
        .map(|entry| (entry.thumbprint.clone(), entry))
        .collect();

    let certificates = trust_store
        .list()
        .context("Failed to enumerate the certificate store")?;

    let items = certificates
        .into_iter()
        .filter(|certificate| !certificate.thumbprint.is_empty())
        .map(|certificate| {
            let entry = entries.get(&certificate.thumbprint);
            InstalledCertItem {
                installed_via_agent: entry.is_some(),
                cleanup_mode: entry.map(|e| e.cleanup_mode.to_string()),
                keep_until: entry.and_then(|e| e.keep_until),
                keep_reason: entry.and_then(|e| e.keep_reason.clone()),
                job_id: entry.and_then(|e| e.job_id.clone()),
                installed_at: entry.and_then(|e| e.installed_at),
                thumbprint: certificate.thumbprint,
                subject: certificate.subject,
                issuer: certificate.issuer,
                serial: certificate.serial,
                not_before: certificate.not_before,
                not_after: certificate.not_after,
            }
        })
        .collect();

    Ok(InstalledCertsReport {
        device_id: device_id.to_string(),
        items,
    })
}

/// Build and post the snapshot; failures are logged and reported as `false`
pub async fn send_snapshot(
    api: &AgentApi,
    device_id: &str,
    trust_store: &dyn TrustStore,
    registry: &RetentionStore,
) -> bool {
    let report = match build_snapshot(device_id, trust_store, registry) {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Installed certs report failed: {:#}", e);
            return false;
        }
    };

    match api.report_installed_certs(&report).await {
        Ok(()) => {
            tracing::info!("Installed certs report sent ({} certificates)", report.items.len());
            true
        }
        Err(e) => {
            tracing::warn!("Installed certs report failed: {}", e);
            false
        }
    }
}
