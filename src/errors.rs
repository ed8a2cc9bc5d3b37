//! Error taxonomy for the tunnel core.
//!
//! Handshake and control-plane failures are surfaced through [`Error`];
//! data-plane decryption failures are never surfaced — they are absorbed
//! by the receiver and classified into counters (see `framing::DropReason`).

use thiserror::Error;

/// Top-level error type for the tunnel core.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Wire parse failure, version mismatch, suite-name mismatch or
    /// length-prefix inconsistency during the handshake.
    #[error("handshake format error: {0}")]
    HandshakeFormat(String),

    /// Signature verification failure or PSK HMAC mismatch.
    /// Deliberately carries no detail.
    #[error("handshake verification failed")]
    HandshakeVerify,

    /// A handshake stage exceeded its timer.
    #[error("handshake stage timed out")]
    HandshakeTimeout,

    /// The suite identifier is not present in the registry.
    #[error("unknown suite: {0}")]
    UnknownSuite(String),

    /// The registry names a primitive this build cannot instantiate.
    #[error("algorithm unavailable: {0}")]
    UnavailableAlgorithm(String),

    /// Sender reached the end of the 64-bit sequence space without rekey.
    #[error("send sequence space exhausted, rekey required")]
    SequenceExhausted,

    /// AEAD seal failure. Not reachable with well-formed inputs.
    #[error("AEAD operation failed")]
    Aead,

    /// Control-plane rekey failure.
    #[error("rekey failed: {0}")]
    Rekey(#[from] RekeyError),

    /// Socket or file I/O.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure modes of the two-phase rekey protocol.
#[derive(Debug, Error)]
pub enum RekeyError {
    /// Responder rejected the prepare phase.
    #[error("prepare rejected: {0}")]
    PrepareFailed(String),

    /// No commit arrived within the preparation window.
    #[error("commit timed out")]
    CommitTimeout,

    /// The swap-phase handshake failed or timed out.
    #[error("swap failed")]
    SwapFailed,

    /// A peer that may not initiate rekey tried to.
    #[error("unauthorized initiator")]
    Unauthorized,
}
