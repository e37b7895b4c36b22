use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::entry::{InstalledThumbprintEntry, RetentionMode};
use crate::error::AgentError;
use crate::seal::{SecretSeal, read_sealed, write_sealed};

/// One element of the persisted registry.
///
/// Current files hold entry objects; files written by early agents hold bare
/// thumbprint strings. Both shapes are accepted, element by element.
#[derive(Deserialize)]
#[serde(untagged)]
enum RegistryRecord {
    Structured(InstalledThumbprintEntry),
    Legacy(String),
}

impl From<RegistryRecord> for InstalledThumbprintEntry {
    fn from(record: RegistryRecord) -> Self {
        match record {
            RegistryRecord::Structured(entry) => entry,
            RegistryRecord::Legacy(thumbprint) => InstalledThumbprintEntry::legacy(&thumbprint),
        }
    }
}

/// Parse registry bytes in either the structured or the legacy format
pub fn parse_registry(bytes: &[u8]) -> Result<Vec<InstalledThumbprintEntry>, serde_json::Error> {
    let records: Vec<RegistryRecord> = serde_json::from_slice(bytes)?;
    Ok(records.into_iter().map(Into::into).collect())
}

/// Whether [`RetentionStore::upsert`] created or refreshed an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Inserted,
    Updated,
}

/// Sealed registry of certificates installed by the agent
#[derive(Clone)]
pub struct RetentionStore {
    path: PathBuf,
    seal: Arc<dyn SecretSeal>,
}

impl RetentionStore {
    pub fn new(path: PathBuf, seal: Arc<dyn SecretSeal>) -> Self {
        Self { path, seal }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load raw entries. Unreadable state is logged and treated as empty.
    pub fn load(&self) -> Vec<InstalledThumbprintEntry> {
        let bytes = match read_sealed(self.seal.as_ref(), &self.path) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::error!("Failed to read installed thumbprints: {}", e);
                return Vec::new();
            }
        };

        match parse_registry(&bytes) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(
                    "Failed to decode installed thumbprints at {}: {}",
                    self.path.display(),
                    e
                );
                Vec::new()
            }
        }
    }

    /// Load entries collapsed to one per canonical thumbprint
    pub fn load_normalized(&self) -> Vec<InstalledThumbprintEntry> {
        normalize(self.load())
    }

    pub fn save(&self, entries: &[InstalledThumbprintEntry]) -> Result<(), AgentError> {
        let json = serde_json::to_vec_pretty(entries).map_err(|e| AgentError::PersistenceFailure {
            path: self.path.clone(),
            message: format!("Failed to serialize installed thumbprints: {}", e),
        })?;

        write_sealed(self.seal.as_ref(), &self.path, &json)?;
        tracing::debug!("Installed thumbprints updated ({} entries)", entries.len());
        Ok(())
    }

    /// Record an install, refreshing the existing entry for the same certificate
    pub fn upsert(&self, entry: InstalledThumbprintEntry) -> Result<Upserted, AgentError> {
        let canonical = entry.canonical_thumbprint();
        let mut entries = self.load_normalized();

        let outcome = match entries.iter_mut().find(|e| e.thumbprint == canonical) {
            Some(existing) => {
                existing.job_id = entry.job_id;
                existing.cleanup_mode = entry.cleanup_mode;
                existing.keep_until = entry.keep_until;
                existing.keep_reason = entry.keep_reason;
                existing.installed_at = entry.installed_at;
                Upserted::Updated
            }
            None => {
                entries.push(InstalledThumbprintEntry {
                    thumbprint: canonical,
                    ..entry
                });
                Upserted::Inserted
            }
        };

        self.save(&entries)?;
        Ok(outcome)
    }
}

/// Collapse raw entries to one per canonical thumbprint.
///
/// Groups keep the order in which their thumbprint first appears. Entries
/// with an empty thumbprint are dropped.
pub fn normalize(entries: Vec<InstalledThumbprintEntry>) -> Vec<InstalledThumbprintEntry> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<InstalledThumbprintEntry>> = HashMap::new();

    for entry in entries {
        let key = entry.canonical_thumbprint();
        if key.is_empty() {
            continue;
        }
        groups
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(entry);
    }

    order
        .into_iter()
        .filter_map(|key| {
            let group = groups.remove(&key)?;
            let mut best = select_best(&group)?.clone();
            best.thumbprint = key;
            Some(best)
        })
        .collect()
}

/// Pick the entry whose retention wins for one certificate.
///
/// EXEMPT beats KEEP_UNTIL beats everything else. Among EXEMPT entries the
/// newest install wins; among KEEP_UNTIL entries the latest bound wins, then
/// the newest install. Otherwise the newest install wins.
pub fn select_best(group: &[InstalledThumbprintEntry]) -> Option<&InstalledThumbprintEntry> {
    let installed = |e: &InstalledThumbprintEntry| e.installed_at.unwrap_or(DateTime::<Utc>::MIN_UTC);
    let keep_until = |e: &InstalledThumbprintEntry| e.keep_until.unwrap_or(DateTime::<Utc>::MIN_UTC);

    let with_mode = |mode: RetentionMode| group.iter().filter(move |e| e.cleanup_mode == mode);

    first_max_by_key(with_mode(RetentionMode::Exempt), installed)
        .or_else(|| {
            first_max_by_key(with_mode(RetentionMode::KeepUntil), |e| {
                (keep_until(e), installed(e))
            })
        })
        .or_else(|| first_max_by_key(group.iter(), installed))
}

/// Like `max_by_key`, but ties keep the earliest element
fn first_max_by_key<'a, K, I, F>(iter: I, key: F) -> Option<&'a InstalledThumbprintEntry>
where
    I: Iterator<Item = &'a InstalledThumbprintEntry>,
    F: Fn(&InstalledThumbprintEntry) -> K,
    K: Ord,
{
    iter.fold(None, |best, candidate| match best {
        Some(current) if key(current) >= key(candidate) => Some(current),
        _ => Some(candidate),
    })
}
