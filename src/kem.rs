//! ML-KEM key encapsulation behind a single dispatch enum.
//!
//! # Security Model
//! - **IND-CCA2 secure**: FIPS 203 parameter sets 512/768/1024
//! - **Forward secrecy**: every handshake generates a fresh keypair
//! - **Shared secrets**: 32 bytes, zeroized as soon as dropped
//!
//! The algorithm is chosen once per session by the suite registry; all
//! callers go through [`KemAlgorithm`] so no other module names a
//! `pqcrypto` parameter set directly.

#![forbid(unsafe_code)]

use pqcrypto_mlkem::{mlkem1024, mlkem512, mlkem768};
use pqcrypto_traits::kem::{
    Ciphertext as KemCiphertext, PublicKey as KemPublicKey, SharedSecret as KemSharedSecret,
};
use zeroize::Zeroizing;

use crate::errors::Error;

/* ============================================================================
 * Dispatch
 * ========================================================================== */

/// One of the three ML-KEM parameter sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KemAlgorithm {
    MlKem512,
    MlKem768,
    MlKem1024,
}

/// Decapsulation key, tagged with its parameter set.
///
/// The inner `pqcrypto` secret keys zeroize their memory on drop.
pub enum KemSecretKey {
    MlKem512(mlkem512::SecretKey),
    MlKem768(mlkem768::SecretKey),
    MlKem1024(mlkem1024::SecretKey),
}

impl KemAlgorithm {
    /// Resolve a registry KEM name.
    pub fn from_name(name: &str) -> Result<Self, Error> {
        match name {
            "ML-KEM-512" => Ok(Self::MlKem512),
            "ML-KEM-768" => Ok(Self::MlKem768),
            "ML-KEM-1024" => Ok(Self::MlKem1024),
            other => Err(Error::UnavailableAlgorithm(other.to_string())),
        }
    }

    /// Generate an ephemeral keypair. Returns the encapsulation key bytes
    /// and the typed decapsulation key.
    pub fn generate(&self) -> (Vec<u8>, KemSecretKey) {
        match self {
            Self::MlKem512 => {
                let (pk, sk) = mlkem512::keypair();
                (pk.as_bytes().to_vec(), KemSecretKey::MlKem512(sk))
            }
            Self::MlKem768 => {
                let (pk, sk) = mlkem768::keypair();
                (pk.as_bytes().to_vec(), KemSecretKey::MlKem768(sk))
            }
            Self::MlKem1024 => {
                let (pk, sk) = mlkem1024::keypair();
                (pk.as_bytes().to_vec(), KemSecretKey::MlKem1024(sk))
            }
        }
    }

    /// Encapsulate against a peer encapsulation key.
    ///
    /// Returns `(ciphertext, shared_secret)`.
    pub fn encapsulate(&self, peer_pk: &[u8]) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>), Error> {
        match self {
            Self::MlKem512 => {
                let pk = mlkem512::PublicKey::from_bytes(peer_pk)
                    .map_err(|_| Error::HandshakeFormat("malformed KEM public key".into()))?;
                let (ss, ct) = mlkem512::encapsulate(&pk);
                Ok((ct.as_bytes().to_vec(), Zeroizing::new(ss.as_bytes().to_vec())))
            }
            Self::MlKem768 => {
                let pk = mlkem768::PublicKey::from_bytes(peer_pk)
                    .map_err(|_| Error::HandshakeFormat("malformed KEM public key".into()))?;
                let (ss, ct) = mlkem768::encapsulate(&pk);
                Ok((ct.as_bytes().to_vec(), Zeroizing::new(ss.as_bytes().to_vec())))
            }
            Self::MlKem1024 => {
                let pk = mlkem1024::PublicKey::from_bytes(peer_pk)
                    .map_err(|_| Error::HandshakeFormat("malformed KEM public key".into()))?;
                let (ss, ct) = mlkem1024::encapsulate(&pk);
                Ok((ct.as_bytes().to_vec(), Zeroizing::new(ss.as_bytes().to_vec())))
            }
        }
    }
}

impl KemSecretKey {
    /// Decapsulate a ciphertext produced against the matching public key.
    pub fn decapsulate(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        match self {
            Self::MlKem512(sk) => {
                let ct = mlkem512::Ciphertext::from_bytes(ciphertext)
                    .map_err(|_| Error::HandshakeFormat("malformed KEM ciphertext".into()))?;
                let ss = mlkem512::decapsulate(&ct, sk);
                Ok(Zeroizing::new(ss.as_bytes().to_vec()))
            }
            Self::MlKem768(sk) => {
                let ct = mlkem768::Ciphertext::from_bytes(ciphertext)
                    .map_err(|_| Error::HandshakeFormat("malformed KEM ciphertext".into()))?;
                let ss = mlkem768::decapsulate(&ct, sk);
                Ok(Zeroizing::new(ss.as_bytes().to_vec()))
            }
            Self::MlKem1024(sk) => {
                let ct = mlkem1024::Ciphertext::from_bytes(ciphertext)
                    .map_err(|_| Error::HandshakeFormat("malformed KEM ciphertext".into()))?;
                let ss = mlkem1024::decapsulate(&ct, sk);
                Ok(Zeroizing::new(ss.as_bytes().to_vec()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encap_decap_agree() {
        for name in ["ML-KEM-512", "ML-KEM-768", "ML-KEM-1024"] {
            let kem = KemAlgorithm::from_name(name).unwrap();
            let (pk, sk) = kem.generate();
            let (ct, ss_sender) = kem.encapsulate(&pk).unwrap();
            let ss_receiver = sk.decapsulate(&ct).unwrap();
            assert_eq!(&*ss_sender, &*ss_receiver, "{name}");
            assert_eq!(ss_sender.len(), 32);
        }
    }

    #[test]
    fn unknown_name_rejected() {
        assert!(matches!(
            KemAlgorithm::from_name("ML-KEM-2048"),
            Err(Error::UnavailableAlgorithm(_))
        ));
    }

    #[test]
    fn garbage_public_key_rejected() {
        let kem = KemAlgorithm::from_name("ML-KEM-768").unwrap();
        assert!(kem.encapsulate(&[0u8; 17]).is_err());
    }
}
