use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use super::api::CertificatePayload;
use crate::error::AgentError;
use crate::platform::trust_store::{PfxIdentity, TrustStore};
use crate::retention::{InstalledThumbprintEntry, RetentionStore, Upserted};

/// Imports delivered certificates and records them for cleanup
pub struct CertificateInstaller {
    trust_store: Arc<dyn TrustStore>,
    registry: RetentionStore,
}

impl CertificateInstaller {
    pub fn new(trust_store: Arc<dyn TrustStore>, registry: RetentionStore) -> Self {
        Self {
            trust_store,
            registry,
        }
    }

    pub fn registry(&self) -> &RetentionStore {
        &self.registry
    }

    /// Install the payload of job `job_id` and return its canonical thumbprint
    pub fn install(&self, job_id: &str, payload: &CertificatePayload) -> Result<String, AgentError> {
        self.install_at(job_id, payload, Utc::now())
    }

    /// `job_id` is recorded when the payload does not name its job
    pub fn install_at(
        &self,
        job_id: &str,
        payload: &CertificatePayload,
        now: DateTime<Utc>,
    ) -> Result<String, AgentError> {
        let der = STANDARD
            .decode(payload.pfx_base64.trim())
            .map_err(|e| AgentError::InstallFailure(format!("PFX is not valid base64: {}", e)))?;

        let identity = PfxIdentity::from_pkcs12(&der, &payload.password)
            .map_err(|e| AgentError::InstallFailure(format!("{:#}", e)))?;
        let thumbprint = identity
            .thumbprint()
            .map_err(|e| AgentError::InstallFailure(format!("{:#}", e)))?;

        let existing = self
            .trust_store
            .find(&thumbprint)
            .map_err(|e| AgentError::InstallFailure(format!("{:#}", e)))?;
        if existing.is_empty() {
            self.trust_store
                .import(&identity)
                .map_err(|e| AgentError::InstallFailure(format!("{:#}", e)))?;
            match payload.generated_at {
                Some(generated_at) => tracing::info!(
                    "Certificate {} imported (bundle generated {})",
                    thumbprint,
                    generated_at.to_rfc3339()
                ),
                None => tracing::info!("Certificate {} imported", thumbprint),
            }
        } else {
            tracing::info!("Certificate {} already present; skipping import", thumbprint);
        }

        let entry = InstalledThumbprintEntry {
            thumbprint: thumbprint.clone(),
            job_id: payload
                .job_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .or_else(|| Some(job_id.to_string())),
            cleanup_mode: payload.cleanup_mode,
            keep_until: payload.keep_until,
            keep_reason: payload.keep_reason.clone(),
            installed_at: Some(now),
        };

        match self.registry.upsert(entry) {
            Ok(Upserted::Inserted) => {
                tracing::info!("Installed thumbprint recorded: {} ({})", thumbprint, payload.cleanup_mode)
            }
            Ok(Upserted::Updated) => {
                tracing::info!("Updated retention policy for thumbprint: {} ({})", thumbprint, payload.cleanup_mode)
            }
            Err(e) => {
                return Err(AgentError::InstallFailure(format!(
                    "Certificate imported but not recorded: {}",
                    e
                )));
            }
        }

        Ok(thumbprint)
    }
}
