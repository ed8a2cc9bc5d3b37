//! Post-quantum signatures behind a single dispatch enum.
//!
//! # Security Model
//! - **ML-DSA-44/65/87**: FIPS 204 lattice signatures
//! - **Falcon-512/1024**: compact NTRU lattice signatures
//! - **SLH-DSA-SHA2-128f/256f**: FIPS 205 hash-based signatures ("fast"
//!   parameter sets)
//!
//! Detached signatures only: the handshake signs a transcript it already
//! possesses on both sides. Verification failure and malformed input are
//! indistinguishable to callers.

#![forbid(unsafe_code)]

use pqcrypto_falcon::{falcon1024, falcon512};
use pqcrypto_mldsa::{mldsa44, mldsa65, mldsa87};
use pqcrypto_sphincsplus::{sphincssha2128fsimple, sphincssha2256fsimple};
use pqcrypto_traits::sign::{
    DetachedSignature as DetachedSignatureTrait, PublicKey as SigPublicKey,
    SecretKey as SigSecretKeyTrait,
};

use crate::errors::Error;

/* ============================================================================
 * Dispatch
 * ========================================================================== */

/// One of the registered signature schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigAlgorithm {
    MlDsa44,
    MlDsa65,
    MlDsa87,
    Falcon512,
    Falcon1024,
    SlhDsa128f,
    SlhDsa256f,
}

/// Signing key, tagged with its scheme.
///
/// The inner `pqcrypto` secret keys zeroize their memory on drop.
pub enum SigSecretKey {
    MlDsa44(mldsa44::SecretKey),
    MlDsa65(mldsa65::SecretKey),
    MlDsa87(mldsa87::SecretKey),
    Falcon512(falcon512::SecretKey),
    Falcon1024(falcon1024::SecretKey),
    SlhDsa128f(sphincssha2128fsimple::SecretKey),
    SlhDsa256f(sphincssha2256fsimple::SecretKey),
}

macro_rules! verify_detached {
    ($m:ident, $vk:expr, $msg:expr, $sig:expr) => {{
        let pk = $m::PublicKey::from_bytes($vk).map_err(|_| Error::HandshakeVerify)?;
        let sig = $m::DetachedSignature::from_bytes($sig).map_err(|_| Error::HandshakeVerify)?;
        $m::verify_detached_signature(&sig, $msg, &pk).map_err(|_| Error::HandshakeVerify)
    }};
}

impl SigAlgorithm {
    /// Resolve a registry signature name.
    pub fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            "ML-DSA-44" => Ok(Self::MlDsa44),
            "ML-DSA-65" => Ok(Self::MlDsa65),
            "ML-DSA-87" => Ok(Self::MlDsa87),
            "Falcon-512" => Ok(Self::Falcon512),
            "Falcon-1024" => Ok(Self::Falcon1024),
            "SLH-DSA-SHA2-128f" => Ok(Self::SlhDsa128f),
            "SLH-DSA-SHA2-256f" => Ok(Self::SlhDsa256f),
            other => Err(Error::UnavailableAlgorithm(other.to_string())),
        }
    }

    /// Generate a long-term keypair. Returns the verifying key bytes and
    /// the typed signing key.
    pub fn generate(&self) -> (Vec<u8>, SigSecretKey) {
        match self {
            Self::MlDsa44 => {
                let (pk, sk) = mldsa44::keypair();
                (pk.as_bytes().to_vec(), SigSecretKey::MlDsa44(sk))
            }
            Self::MlDsa65 => {
                let (pk, sk) = mldsa65::keypair();
                (pk.as_bytes().to_vec(), SigSecretKey::MlDsa65(sk))
            }
            Self::MlDsa87 => {
                let (pk, sk) = mldsa87::keypair();
                (pk.as_bytes().to_vec(), SigSecretKey::MlDsa87(sk))
            }
            Self::Falcon512 => {
                let (pk, sk) = falcon512::keypair();
                (pk.as_bytes().to_vec(), SigSecretKey::Falcon512(sk))
            }
            Self::Falcon1024 => {
                let (pk, sk) = falcon1024::keypair();
                (pk.as_bytes().to_vec(), SigSecretKey::Falcon1024(sk))
            }
            Self::SlhDsa128f => {
                let (pk, sk) = sphincssha2128fsimple::keypair();
                (pk.as_bytes().to_vec(), SigSecretKey::SlhDsa128f(sk))
            }
            Self::SlhDsa256f => {
                let (pk, sk) = sphincssha2256fsimple::keypair();
                (pk.as_bytes().to_vec(), SigSecretKey::SlhDsa256f(sk))
            }
        }
    }

    /// Import a signing key previously exported with
    /// [`SigSecretKey::to_bytes`].
    pub fn secret_from_bytes(&self, bytes: &[u8]) -> Result<SigSecretKey, Error> {
        match self {
            Self::MlDsa44 => mldsa44::SecretKey::from_bytes(bytes).map(SigSecretKey::MlDsa44),
            Self::MlDsa65 => mldsa65::SecretKey::from_bytes(bytes).map(SigSecretKey::MlDsa65),
            Self::MlDsa87 => mldsa87::SecretKey::from_bytes(bytes).map(SigSecretKey::MlDsa87),
            Self::Falcon512 => {
                falcon512::SecretKey::from_bytes(bytes).map(SigSecretKey::Falcon512)
            }
            Self::Falcon1024 => {
                falcon1024::SecretKey::from_bytes(bytes).map(SigSecretKey::Falcon1024)
            }
            Self::SlhDsa128f => {
                sphincssha2128fsimple::SecretKey::from_bytes(bytes).map(SigSecretKey::SlhDsa128f)
            }
            Self::SlhDsa256f => {
                sphincssha2256fsimple::SecretKey::from_bytes(bytes).map(SigSecretKey::SlhDsa256f)
            }
        }
        .map_err(|_| Error::Config("malformed signing key bytes".into()))
    }

    /// Verify a detached signature. Bad signature and malformed input both
    /// fail with [`Error::HandshakeVerify`].
    pub fn verify(&self, verifying_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), Error> {
        match self {
            Self::MlDsa44 => verify_detached!(mldsa44, verifying_key, message, signature),
            Self::MlDsa65 => verify_detached!(mldsa65, verifying_key, message, signature),
            Self::MlDsa87 => verify_detached!(mldsa87, verifying_key, message, signature),
            Self::Falcon512 => verify_detached!(falcon512, verifying_key, message, signature),
            Self::Falcon1024 => verify_detached!(falcon1024, verifying_key, message, signature),
            Self::SlhDsa128f => {
                verify_detached!(sphincssha2128fsimple, verifying_key, message, signature)
            }
            Self::SlhDsa256f => {
                verify_detached!(sphincssha2256fsimple, verifying_key, message, signature)
            }
        }
    }
}

impl SigSecretKey {
    /// Scheme this key belongs to.
    pub fn algorithm(&self) -> SigAlgorithm {
        match self {
            Self::MlDsa44(_) => SigAlgorithm::MlDsa44,
            Self::MlDsa65(_) => SigAlgorithm::MlDsa65,
            Self::MlDsa87(_) => SigAlgorithm::MlDsa87,
            Self::Falcon512(_) => SigAlgorithm::Falcon512,
            Self::Falcon1024(_) => SigAlgorithm::Falcon1024,
            Self::SlhDsa128f(_) => SigAlgorithm::SlhDsa128f,
            Self::SlhDsa256f(_) => SigAlgorithm::SlhDsa256f,
        }
    }

    /// Detached signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        match self {
            Self::MlDsa44(sk) => mldsa44::detached_sign(message, sk).as_bytes().to_vec(),
            Self::MlDsa65(sk) => mldsa65::detached_sign(message, sk).as_bytes().to_vec(),
            Self::MlDsa87(sk) => mldsa87::detached_sign(message, sk).as_bytes().to_vec(),
            Self::Falcon512(sk) => falcon512::detached_sign(message, sk).as_bytes().to_vec(),
            Self::Falcon1024(sk) => falcon1024::detached_sign(message, sk).as_bytes().to_vec(),
            Self::SlhDsa128f(sk) => {
                sphincssha2128fsimple::detached_sign(message, sk).as_bytes().to_vec()
            }
            Self::SlhDsa256f(sk) => {
                sphincssha2256fsimple::detached_sign(message, sk).as_bytes().to_vec()
            }
        }
    }

    /// Export raw key bytes. SENSITIVE — callers wrap in `Zeroizing`.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::MlDsa44(sk) => sk.as_bytes().to_vec(),
            Self::MlDsa65(sk) => sk.as_bytes().to_vec(),
            Self::MlDsa87(sk) => sk.as_bytes().to_vec(),
            Self::Falcon512(sk) => sk.as_bytes().to_vec(),
            Self::Falcon1024(sk) => sk.as_bytes().to_vec(),
            Self::SlhDsa128f(sk) => sk.as_bytes().to_vec(),
            Self::SlhDsa256f(sk) => sk.as_bytes().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        // One representative per family; SLH-DSA covered in the registry
        // availability test to keep this one quick.
        for name in ["ML-DSA-44", "Falcon-512"] {
            let alg = SigAlgorithm::from_name(name).unwrap();
            let (pk, sk) = alg.generate();
            let msg = b"transcript bytes";
            let sig = sk.sign(msg);
            alg.verify(&pk, msg, &sig).unwrap();
            assert!(alg.verify(&pk, b"different transcript", &sig).is_err());
        }
    }

    #[test]
    fn wrong_key_rejected() {
        let alg = SigAlgorithm::MlDsa44;
        let (_, sk) = alg.generate();
        let (other_pk, _) = alg.generate();
        let sig = sk.sign(b"msg");
        assert!(matches!(
            alg.verify(&other_pk, b"msg", &sig),
            Err(Error::HandshakeVerify)
        ));
    }

    #[test]
    fn secret_key_bytes_roundtrip() {
        let alg = SigAlgorithm::Falcon512;
        let (pk, sk) = alg.generate();
        let restored = alg.secret_from_bytes(&sk.to_bytes()).unwrap();
        let sig = restored.sign(b"msg");
        alg.verify(&pk, b"msg", &sig).unwrap();
        assert_eq!(restored.algorithm(), alg);
    }

    #[test]
    fn unknown_name_rejected() {
        assert!(matches!(
            SigAlgorithm::from_name("Ed25519"),
            Err(Error::UnavailableAlgorithm(_))
        ));
    }
}
