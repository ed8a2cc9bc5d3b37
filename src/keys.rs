//! Long-term signature key storage.
//!
//! The GCS holds signing keys, the drone holds the matching verifying
//! keys, both pre-provisioned out of band as opaque byte files. One key
//! pair per signature scheme, so a rekey to a suite with a different
//! signature family works iff the material for that family is present —
//! that check is what "locally implementable" means to the rekey
//! responder.
//!
//! On-disk layout under one directory: `<slug>.key` (signing, raw bytes)
//! and `<slug>.pub` (verifying, raw bytes), where the slug is the
//! lowercase signature name, e.g. `ml-dsa-65.key`.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::errors::Error;
use crate::sig::{SigAlgorithm, SigSecretKey};

/// File-name slug for a signature scheme.
pub fn sig_slug(sig_name: &str) -> String {
    sig_name.to_ascii_lowercase()
}

/// In-memory map of long-term signature material, keyed by signature name.
#[derive(Default, Clone)]
pub struct SigKeyStore {
    signing: HashMap<String, Arc<SigSecretKey>>,
    verifying: HashMap<String, Vec<u8>>,
}

impl SigKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_signing(&mut self, sig_name: &str, key: SigSecretKey) {
        self.signing.insert(sig_name.to_string(), Arc::new(key));
    }

    pub fn insert_verifying(&mut self, sig_name: &str, key: Vec<u8>) {
        self.verifying.insert(sig_name.to_string(), key);
    }

    pub fn signing_for(&self, sig_name: &str) -> Option<Arc<SigSecretKey>> {
        self.signing.get(sig_name).cloned()
    }

    pub fn verifying_for(&self, sig_name: &str) -> Option<&[u8]> {
        self.verifying.get(sig_name).map(|v| v.as_slice())
    }

    /// Can this endpoint play its role for a suite using `sig_name`?
    pub fn supports(&self, sig_name: &str) -> bool {
        self.signing.contains_key(sig_name) || self.verifying.contains_key(sig_name)
    }

    /// Load every recognizable `<slug>.key` / `<slug>.pub` file under `dir`.
    pub fn load_dir(dir: &Path, schemes: &[&str]) -> Result<Self, Error> {
        let mut store = Self::new();
        for name in schemes {
            let slug = sig_slug(name);
            let key_path = dir.join(format!("{slug}.key"));
            if key_path.is_file() {
                let bytes = Zeroizing::new(fs::read(&key_path)?);
                let alg = SigAlgorithm::from_name(name)?;
                store.insert_signing(name, alg.secret_from_bytes(&bytes)?);
            }
            let pub_path = dir.join(format!("{slug}.pub"));
            if pub_path.is_file() {
                store.insert_verifying(name, fs::read(&pub_path)?);
            }
        }
        if store.signing.is_empty() && store.verifying.is_empty() {
            return Err(Error::Config(format!(
                "no signature key material found under {}",
                dir.display()
            )));
        }
        Ok(store)
    }

    /// Generate a fresh keypair for `sig_name` and write both halves under
    /// `dir`. Returns the written file names.
    pub fn generate_into(dir: &Path, sig_name: &str) -> Result<(String, String), Error> {
        let alg = SigAlgorithm::from_name(sig_name)?;
        let (pk, sk) = alg.generate();
        fs::create_dir_all(dir)?;
        let slug = sig_slug(sig_name);
        let key_name = format!("{slug}.key");
        let pub_name = format!("{slug}.pub");
        let sk_bytes = Zeroizing::new(sk.to_bytes());
        fs::write(dir.join(&key_name), &*sk_bytes)?;
        fs::write(dir.join(&pub_name), &pk)?;
        Ok((key_name, pub_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_format() {
        assert_eq!(sig_slug("ML-DSA-65"), "ml-dsa-65");
        assert_eq!(sig_slug("SLH-DSA-SHA2-128f"), "slh-dsa-sha2-128f");
    }

    #[test]
    fn in_memory_lookup() {
        let alg = SigAlgorithm::Falcon512;
        let (pk, sk) = alg.generate();
        let mut store = SigKeyStore::new();
        store.insert_signing("Falcon-512", sk);
        store.insert_verifying("Falcon-512", pk);
        assert!(store.supports("Falcon-512"));
        assert!(!store.supports("ML-DSA-87"));
        assert!(store.signing_for("Falcon-512").is_some());
        assert!(store.verifying_for("ML-DSA-87").is_none());
    }

    #[test]
    fn generate_and_reload_roundtrip() {
        let dir = std::env::temp_dir().join(format!("pqdg-keys-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        SigKeyStore::generate_into(&dir, "ML-DSA-44").unwrap();
        let store = SigKeyStore::load_dir(&dir, &["ML-DSA-44", "Falcon-512"]).unwrap();
        let sk = store.signing_for("ML-DSA-44").unwrap();
        let pk = store.verifying_for("ML-DSA-44").unwrap();
        let sig = sk.sign(b"probe");
        SigAlgorithm::MlDsa44.verify(pk, b"probe", &sig).unwrap();
        assert!(!store.supports("Falcon-512"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_dir_rejected() {
        let dir = std::env::temp_dir().join(format!("pqdg-empty-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        assert!(matches!(
            SigKeyStore::load_dir(&dir, &["ML-DSA-44"]),
            Err(Error::Config(_))
        ));
        let _ = fs::remove_dir_all(&dir);
    }
}
