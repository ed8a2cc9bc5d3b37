//! Cryptographic suite registry.
//!
//! A suite binds one KEM, one signature scheme, the AEAD and the KDF to a
//! stable identifier and to the four 1-byte wire IDs carried in every packet
//! header. The registry is a read-only static table; the four-tuple of wire
//! IDs is unique across it.

use crate::errors::Error;

/// AEAD used by every suite.
pub const AEAD_NAME: &str = "AES-256-GCM";

/// KDF used by every suite.
pub const KDF_NAME: &str = "HKDF-SHA256";

/// Immutable description of one KEM x signature combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Suite {
    /// Stable identifier, e.g. `cs-mlkem768-aesgcm-mldsa65`.
    pub suite_id: &'static str,
    /// KEM name as it appears on the wire and in the transcript.
    pub kem_name: &'static str,
    /// Signature name as it appears on the wire and in the transcript.
    pub sig_name: &'static str,
    /// Always [`AEAD_NAME`].
    pub aead: &'static str,
    /// Always [`KDF_NAME`].
    pub kdf: &'static str,
    /// NIST security category, keyed by the KEM parameter set.
    pub nist_level: u8,
    /// KEM family wire ID.
    pub kem_id: u8,
    /// KEM parameter wire ID.
    pub kem_param_id: u8,
    /// Signature family wire ID.
    pub sig_id: u8,
    /// Signature parameter wire ID.
    pub sig_param_id: u8,
}

const fn suite(
    suite_id: &'static str,
    kem_name: &'static str,
    sig_name: &'static str,
    nist_level: u8,
    kem_param_id: u8,
    sig_id: u8,
    sig_param_id: u8,
) -> Suite {
    Suite {
        suite_id,
        kem_name,
        sig_name,
        aead: AEAD_NAME,
        kdf: KDF_NAME,
        nist_level,
        kem_id: 0x01,
        kem_param_id,
        sig_id,
        sig_param_id,
    }
}

// Wire ID assignment: kem_id 0x01 = ML-KEM (param 1/2/3 = 512/768/1024);
// sig_id 0x01 = ML-DSA (param 1/2/3 = 44/65/87), 0x02 = Falcon (1/2 =
// 512/1024), 0x03 = SLH-DSA-SHA2 (1 = 128f, 2 = 256f).
static REGISTRY: &[Suite] = &[
    // ML-KEM-512
    suite("cs-mlkem512-aesgcm-mldsa44", "ML-KEM-512", "ML-DSA-44", 1, 1, 0x01, 1),
    suite("cs-mlkem512-aesgcm-mldsa65", "ML-KEM-512", "ML-DSA-65", 1, 1, 0x01, 2),
    suite("cs-mlkem512-aesgcm-mldsa87", "ML-KEM-512", "ML-DSA-87", 1, 1, 0x01, 3),
    suite("cs-mlkem512-aesgcm-falcon512", "ML-KEM-512", "Falcon-512", 1, 1, 0x02, 1),
    suite("cs-mlkem512-aesgcm-falcon1024", "ML-KEM-512", "Falcon-1024", 1, 1, 0x02, 2),
    suite("cs-mlkem512-aesgcm-slhdsa128f", "ML-KEM-512", "SLH-DSA-SHA2-128f", 1, 1, 0x03, 1),
    suite("cs-mlkem512-aesgcm-slhdsa256f", "ML-KEM-512", "SLH-DSA-SHA2-256f", 1, 1, 0x03, 2),
    // ML-KEM-768
    suite("cs-mlkem768-aesgcm-mldsa44", "ML-KEM-768", "ML-DSA-44", 3, 2, 0x01, 1),
    suite("cs-mlkem768-aesgcm-mldsa65", "ML-KEM-768", "ML-DSA-65", 3, 2, 0x01, 2),
    suite("cs-mlkem768-aesgcm-mldsa87", "ML-KEM-768", "ML-DSA-87", 3, 2, 0x01, 3),
    suite("cs-mlkem768-aesgcm-falcon512", "ML-KEM-768", "Falcon-512", 3, 2, 0x02, 1),
    suite("cs-mlkem768-aesgcm-falcon1024", "ML-KEM-768", "Falcon-1024", 3, 2, 0x02, 2),
    suite("cs-mlkem768-aesgcm-slhdsa128f", "ML-KEM-768", "SLH-DSA-SHA2-128f", 3, 2, 0x03, 1),
    suite("cs-mlkem768-aesgcm-slhdsa256f", "ML-KEM-768", "SLH-DSA-SHA2-256f", 3, 2, 0x03, 2),
    // ML-KEM-1024
    suite("cs-mlkem1024-aesgcm-mldsa44", "ML-KEM-1024", "ML-DSA-44", 5, 3, 0x01, 1),
    suite("cs-mlkem1024-aesgcm-mldsa65", "ML-KEM-1024", "ML-DSA-65", 5, 3, 0x01, 2),
    suite("cs-mlkem1024-aesgcm-mldsa87", "ML-KEM-1024", "ML-DSA-87", 5, 3, 0x01, 3),
    suite("cs-mlkem1024-aesgcm-falcon512", "ML-KEM-1024", "Falcon-512", 5, 3, 0x02, 1),
    suite("cs-mlkem1024-aesgcm-falcon1024", "ML-KEM-1024", "Falcon-1024", 5, 3, 0x02, 2),
    suite("cs-mlkem1024-aesgcm-slhdsa128f", "ML-KEM-1024", "SLH-DSA-SHA2-128f", 5, 3, 0x03, 1),
    suite("cs-mlkem1024-aesgcm-slhdsa256f", "ML-KEM-1024", "SLH-DSA-SHA2-256f", 5, 3, 0x03, 2),
];

/// All registered suite identifiers, in registry order.
pub fn list() -> Vec<&'static str> {
    REGISTRY.iter().map(|s| s.suite_id).collect()
}

/// Look up a suite by its stable identifier.
pub fn get(suite_id: &str) -> Result<&'static Suite, Error> {
    REGISTRY
        .iter()
        .find(|s| s.suite_id == suite_id)
        .ok_or_else(|| Error::UnknownSuite(suite_id.to_string()))
}

/// Reverse lookup by the wire ID four-tuple.
pub fn find_by_ids(
    kem_id: u8,
    kem_param_id: u8,
    sig_id: u8,
    sig_param_id: u8,
) -> Option<&'static Suite> {
    REGISTRY.iter().find(|s| {
        s.kem_id == kem_id
            && s.kem_param_id == kem_param_id
            && s.sig_id == sig_id
            && s.sig_param_id == sig_param_id
    })
}

/// The wire ID four-tuple carried in every packet header.
pub fn header_ids(suite: &Suite) -> (u8, u8, u8, u8) {
    (suite.kem_id, suite.kem_param_id, suite.sig_id, suite.sig_param_id)
}

/// HKDF `info` string binding the derived keys to the session and suite:
/// `"pq-drone-gcs:kdf:v1|" || hex(session_id) || "|" || kem_name || "|" || sig_name`.
pub fn hkdf_info(suite: &Suite, session_id: &[u8; 8]) -> Vec<u8> {
    let mut info = Vec::with_capacity(64);
    info.extend_from_slice(b"pq-drone-gcs:kdf:v1|");
    info.extend_from_slice(hex::encode(session_id).as_bytes());
    info.push(b'|');
    info.extend_from_slice(suite.kem_name.as_bytes());
    info.push(b'|');
    info.extend_from_slice(suite.sig_name.as_bytes());
    info
}
