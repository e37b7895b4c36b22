//! Shared fixtures for unit tests.

use anyhow::{Result, bail};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::PKey;
use openssl::x509::{X509Builder, X509NameBuilder};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::platform::trust_store::{PfxIdentity, StoredCertificate, TrustStore};
use crate::retention::canonical_thumbprint;
use crate::seal::{LocalKeySeal, SecretSeal};

pub fn test_seal() -> Arc<dyn SecretSeal> {
    Arc::new(LocalKeySeal::from_key([42u8; 32], "tester"))
}

/// Self-signed P-256 identity bundled as a password-protected PFX
pub fn generate_pfx(common_name: &str, password: &str) -> Vec<u8> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(30).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let certificate = builder.build();

    Pkcs12::builder()
        .name(common_name)
        .pkey(&key)
        .cert(&certificate)
        .build2(password)
        .unwrap()
        .to_der()
        .unwrap()
}

/// Thumbprint of a PFX produced by [`generate_pfx`]
pub fn pfx_thumbprint(pfx: &[u8], password: &str) -> String {
    PfxIdentity::from_pkcs12(pfx, password)
        .unwrap()
        .thumbprint()
        .unwrap()
}

/// In-memory trust store with injectable removal failures
#[derive(Default)]
pub struct MemoryTrustStore {
    certificates: Mutex<HashMap<String, StoredCertificate>>,
    failing_removals: Mutex<HashSet<String>>,
    imports: Mutex<usize>,
}

impl MemoryTrustStore {
    pub fn with_thumbprints(thumbprints: &[&str]) -> Self {
        let store = Self::default();
        for thumbprint in thumbprints {
            store.insert(thumbprint);
        }
        store
    }

    pub fn insert(&self, thumbprint: &str) {
        let canonical = canonical_thumbprint(thumbprint);
        self.certificates.lock().unwrap().insert(
            canonical.clone(),
            StoredCertificate {
                thumbprint: canonical,
                subject: "CN=test".to_string(),
                issuer: "CN=test".to_string(),
                serial: "01".to_string(),
                not_before: None,
                not_after: None,
            },
        );
    }

    pub fn fail_removal_of(&self, thumbprint: &str) {
        self.failing_removals
            .lock()
            .unwrap()
            .insert(canonical_thumbprint(thumbprint));
    }

    pub fn contains(&self, thumbprint: &str) -> bool {
        self.certificates
            .lock()
            .unwrap()
            .contains_key(&canonical_thumbprint(thumbprint))
    }

    pub fn len(&self) -> usize {
        self.certificates.lock().unwrap().len()
    }

    pub fn import_count(&self) -> usize {
        *self.imports.lock().unwrap()
    }
}

impl TrustStore for MemoryTrustStore {
    fn find(&self, thumbprint: &str) -> Result<Vec<StoredCertificate>> {
        let canonical = canonical_thumbprint(thumbprint);
        Ok(self
            .certificates
            .lock()
            .unwrap()
            .get(&canonical)
            .cloned()
            .into_iter()
            .collect())
    }

    fn import(&self, identity: &PfxIdentity) -> Result<()> {
        let described = StoredCertificate::from_x509(identity.certificate())?;
        self.certificates
            .lock()
            .unwrap()
            .insert(described.thumbprint.clone(), described);
        *self.imports.lock().unwrap() += 1;
        Ok(())
    }

    fn remove(&self, certificate: &StoredCertificate) -> Result<()> {
        let canonical = canonical_thumbprint(&certificate.thumbprint);
        if self.failing_removals.lock().unwrap().contains(&canonical) {
            bail!("access denied removing {}", canonical);
        }
        self.certificates.lock().unwrap().remove(&canonical);
        Ok(())
    }

    fn list(&self) -> Result<Vec<StoredCertificate>> {
        let mut all: Vec<_> = self.certificates.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.thumbprint.cmp(&b.thumbprint));
        Ok(all)
    }
}
