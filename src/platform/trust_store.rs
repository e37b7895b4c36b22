use anyhow::{Context, Result, bail};
use chrono::{DateTime, TimeZone, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::hash::MessageDigest;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509, X509NameRef, X509Ref};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::retention::canonical_thumbprint;
use crate::seal::{SecretSeal, write_sealed};

use super::common::{atomic_write, ensure_private_directory};

/// Certificate and private key decoded from a PFX bundle
pub struct PfxIdentity {
    certificate: X509,
    key: PKey<Private>,
    chain: Vec<X509>,
}

impl PfxIdentity {
    /// Decode a password-protected PKCS#12 bundle
    pub fn from_pkcs12(der: &[u8], password: &str) -> Result<Self> {
        let pkcs12 = Pkcs12::from_der(der).context("PFX data is not valid PKCS#12")?;
        let parsed = pkcs12
            .parse2(password)
            .context("Failed to open PFX (wrong password or corrupt bundle)")?;

        let Some(certificate) = parsed.cert else {
            bail!("PFX does not contain a certificate");
        };
        let Some(key) = parsed.pkey else {
            bail!("PFX does not contain a private key");
        };
        let chain = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();

        Ok(Self {
            certificate,
            key,
            chain,
        })
    }

    pub fn certificate(&self) -> &X509Ref {
        &self.certificate
    }

    /// Canonical thumbprint (uppercase hex SHA-1 of the DER certificate)
    pub fn thumbprint(&self) -> Result<String> {
        thumbprint_of(&self.certificate)
    }
}

/// A certificate present in a trust store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCertificate {
    pub thumbprint: String,
    pub subject: String,
    pub issuer: String,
    pub serial: String,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
}

impl StoredCertificate {
    pub fn from_x509(certificate: &X509Ref) -> Result<Self> {
        let serial = certificate
            .serial_number()
            .to_bn()
            .and_then(|bn| bn.to_hex_str().map(|s| s.to_string()))
            .context("Failed to read certificate serial number")?;

        Ok(Self {
            thumbprint: thumbprint_of(certificate)?,
            subject: format_name(certificate.subject_name()),
            issuer: format_name(certificate.issuer_name()),
            serial,
            not_before: asn1_to_utc(certificate.not_before()),
            not_after: asn1_to_utc(certificate.not_after()),
        })
    }
}

/// The current user's certificate store
pub trait TrustStore: Send + Sync {
    /// Certificates whose thumbprint matches (any formatting accepted)
    fn find(&self, thumbprint: &str) -> Result<Vec<StoredCertificate>>;

    /// Import the certificate with its private key persisted for this user
    fn import(&self, identity: &PfxIdentity) -> Result<()>;

    fn remove(&self, certificate: &StoredCertificate) -> Result<()>;

    fn list(&self) -> Result<Vec<StoredCertificate>>;
}

/// Trust store kept as files under the agent's state directory.
///
/// Each certificate is `<THUMBPRINT>.pem` (leaf followed by any chain) with
/// its private key sealed alongside as `<THUMBPRINT>.key`.
pub struct FileTrustStore {
    dir: PathBuf,
    seal: Arc<dyn SecretSeal>,
}

impl FileTrustStore {
    pub fn open(dir: PathBuf, seal: Arc<dyn SecretSeal>) -> Result<Self> {
        ensure_private_directory(&dir)
            .with_context(|| format!("Failed to open certificate store: {}", dir.display()))?;
        Ok(Self { dir, seal })
    }

    fn cert_path(&self, thumbprint: &str) -> PathBuf {
        self.dir.join(format!("{}.pem", thumbprint))
    }

    fn key_path(&self, thumbprint: &str) -> PathBuf {
        self.dir.join(format!("{}.key", thumbprint))
    }

    fn read_certificate(path: &Path) -> Result<StoredCertificate> {
        let pem = std::fs::read(path)
            .with_context(|| format!("Failed to read certificate: {}", path.display()))?;
        let certificate = X509::from_pem(&pem)
            .with_context(|| format!("Failed to parse certificate: {}", path.display()))?;
        StoredCertificate::from_x509(&certificate)
    }
}

impl TrustStore for FileTrustStore {
    fn find(&self, thumbprint: &str) -> Result<Vec<StoredCertificate>> {
        let canonical = canonical_thumbprint(thumbprint);
        if canonical.is_empty() {
            return Ok(Vec::new());
        }

        let path = self.cert_path(&canonical);
        if !path.exists() {
            return Ok(Vec::new());
        }

        Ok(vec![Self::read_certificate(&path)?])
    }

    fn import(&self, identity: &PfxIdentity) -> Result<()> {
        let thumbprint = identity.thumbprint()?;

        let mut pem = identity.certificate.to_pem()?;
        for ca in &identity.chain {
            pem.extend_from_slice(&ca.to_pem()?);
        }
        let key_pem = identity
            .key
            .private_key_to_pem_pkcs8()
            .context("Failed to encode private key")?;

        write_sealed(self.seal.as_ref(), &self.key_path(&thumbprint), &key_pem)?;
        atomic_write(&self.cert_path(&thumbprint), &pem)?;

        tracing::debug!("Imported certificate {} into {}", thumbprint, self.dir.display());
        Ok(())
    }

    fn remove(&self, certificate: &StoredCertificate) -> Result<()> {
        let canonical = canonical_thumbprint(&certificate.thumbprint);

        let cert_path = self.cert_path(&canonical);
        if cert_path.exists() {
            std::fs::remove_file(&cert_path)
                .with_context(|| format!("Failed to delete {}", cert_path.display()))?;
        }

        let key_path = self.key_path(&canonical);
        if key_path.exists() {
            std::fs::remove_file(&key_path)
                .with_context(|| format!("Failed to delete {}", key_path.display()))?;
        }

        Ok(())
    }

    fn list(&self) -> Result<Vec<StoredCertificate>> {
        let mut certificates = Vec::new();

        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list certificate store: {}", self.dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pem") {
                continue;
            }
            match Self::read_certificate(&path) {
                Ok(certificate) => certificates.push(certificate),
                Err(e) => tracing::warn!("Skipping unreadable certificate: {:#}", e),
            }
        }

        certificates.sort_by(|a, b| a.thumbprint.cmp(&b.thumbprint));
        Ok(certificates)
    }
}

fn thumbprint_of(certificate: &X509Ref) -> Result<String> {
    let digest = certificate
        .digest(MessageDigest::sha1())
        .context("Failed to compute certificate thumbprint")?;
    Ok(hex::encode_upper(digest))
}

fn format_name(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let value = String::from_utf8_lossy(entry.data().as_slice());
            format!("{}={}", key, value)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn asn1_to_utc(time: &Asn1TimeRef) -> Option<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0).ok()?;
    let diff = epoch.diff(time).ok()?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    Utc.timestamp_opt(secs, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{generate_pfx, test_seal};
    use assert_fs::TempDir;
    use assert_fs::prelude::*;
    use predicates::prelude::*;

    fn open_store(dir: &TempDir) -> FileTrustStore {
        FileTrustStore::open(dir.path().join("certstore"), test_seal()).unwrap()
    }

    #[test]
    fn pfx_identity_decodes_with_password() {
        let pfx = generate_pfx("client-a", "s3cret");
        let identity = PfxIdentity::from_pkcs12(&pfx, "s3cret").unwrap();

        let thumbprint = identity.thumbprint().unwrap();
        assert_eq!(thumbprint.len(), 40);
        assert_eq!(thumbprint, canonical_thumbprint(&thumbprint));
    }

    #[test]
    fn pfx_identity_rejects_wrong_password_and_garbage() {
        let pfx = generate_pfx("client-a", "s3cret");
        assert!(PfxIdentity::from_pkcs12(&pfx, "wrong").is_err());
        assert!(PfxIdentity::from_pkcs12(b"not a pfx", "s3cret").is_err());
    }

    #[test]
    fn stored_certificate_describes_subject_and_validity() {
        let pfx = generate_pfx("client-b", "pw");
        let identity = PfxIdentity::from_pkcs12(&pfx, "pw").unwrap();

        let described = StoredCertificate::from_x509(identity.certificate()).unwrap();
        assert_eq!(described.subject, "CN=client-b");
        assert_eq!(described.issuer, "CN=client-b");
        assert!(!described.serial.is_empty());
        let (not_before, not_after) = (described.not_before.unwrap(), described.not_after.unwrap());
        assert!(not_before < not_after);
    }

    #[test]
    fn subject_keeps_non_ascii_common_name() {
        let pfx = generate_pfx("Zoë's laptop", "pw");
        let identity = PfxIdentity::from_pkcs12(&pfx, "pw").unwrap();

        let described = StoredCertificate::from_x509(identity.certificate()).unwrap();
        assert_eq!(described.subject, "CN=Zoë's laptop");
    }

    #[test]
    fn import_find_and_remove() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let identity = PfxIdentity::from_pkcs12(&generate_pfx("client-c", "pw"), "pw").unwrap();
        let thumbprint = identity.thumbprint().unwrap();

        store.import(&identity).unwrap();
        dir.child("certstore")
            .child(format!("{}.pem", thumbprint))
            .assert(predicate::path::exists());
        dir.child("certstore")
            .child(format!("{}.key", thumbprint))
            .assert(predicate::path::exists());

        let found = store.find(&thumbprint.to_lowercase()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].thumbprint, thumbprint);

        store.remove(&found[0]).unwrap();
        assert!(store.find(&thumbprint).unwrap().is_empty());
        dir.child("certstore")
            .child(format!("{}.key", thumbprint))
            .assert(predicate::path::missing());
    }

    #[test]
    fn list_returns_every_imported_certificate() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for name in ["one", "two"] {
            let identity = PfxIdentity::from_pkcs12(&generate_pfx(name, "pw"), "pw").unwrap();
            store.import(&identity).unwrap();
        }

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|c| c.subject == "CN=one"));
        assert!(listed.iter().any(|c| c.subject == "CN=two"));
    }

    #[test]
    fn find_with_empty_thumbprint_matches_nothing() {
        let dir = TempDir::new().unwrap();
        assert!(open_store(&dir).find("  ").unwrap().is_empty());
    }
}
