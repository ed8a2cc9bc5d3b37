//! Environment configuration surface.
//!
//! Every key is read from the process environment and validated at
//! startup; any malformed value is fatal. Parsing is written against an
//! injectable lookup so tests never touch process-global state.

use std::net::IpAddr;
use std::time::Duration;

use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::Error;
use crate::framing::WIRE_VERSION;
use crate::replay::{DEFAULT_WINDOW, MIN_WINDOW};

/// Endpoint role in the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Ground control station: handshake server, rekey initiator.
    Gcs,
    /// Drone: handshake client, rekey responder.
    Drone,
}

/// 32-byte pre-shared key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Psk(pub [u8; 32]);

impl Psk {
    /// Parse the 64-hex-character representation.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes = hex::decode(s.trim())
            .map_err(|_| Error::Config("DRONE_PSK is not valid hex".into()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Config("DRONE_PSK must decode to exactly 32 bytes".into()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Validated tunnel configuration.
#[derive(Clone)]
pub struct Config {
    pub tcp_handshake_port: u16,
    pub udp_gcs_rx: u16,
    pub udp_drone_rx: u16,
    pub gcs_plaintext_tx: u16,
    pub gcs_plaintext_rx: u16,
    pub drone_plaintext_tx: u16,
    pub drone_plaintext_rx: u16,
    pub gcs_host: IpAddr,
    pub drone_host: IpAddr,
    pub replay_window: usize,
    pub psk: Psk,
    pub handshake_timeout: Duration,
}

impl Config {
    /// Read and validate the full surface from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read and validate from an arbitrary lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        if let Some(v) = lookup("WIRE_VERSION") {
            let version: u8 = v
                .trim()
                .parse()
                .map_err(|_| Error::Config("WIRE_VERSION is not an integer".into()))?;
            if version != WIRE_VERSION {
                return Err(Error::Config(format!(
                    "WIRE_VERSION is frozen at {WIRE_VERSION}, got {version}"
                )));
            }
        }

        let psk_hex = lookup("DRONE_PSK")
            .ok_or_else(|| Error::Config("DRONE_PSK is required".into()))?;
        let psk = Psk::from_hex(&psk_hex)?;

        let replay_window = match lookup("REPLAY_WINDOW") {
            Some(v) => {
                let w: usize = v
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config("REPLAY_WINDOW is not an integer".into()))?;
                if w < MIN_WINDOW {
                    return Err(Error::Config(format!(
                        "REPLAY_WINDOW must be at least {MIN_WINDOW}, got {w}"
                    )));
                }
                w
            }
            None => DEFAULT_WINDOW,
        };

        let handshake_timeout = match lookup("DEFAULT_TIMEOUT") {
            Some(v) => {
                let secs: u64 = v
                    .trim()
                    .parse()
                    .map_err(|_| Error::Config("DEFAULT_TIMEOUT is not an integer".into()))?;
                if secs == 0 {
                    return Err(Error::Config("DEFAULT_TIMEOUT must be positive".into()));
                }
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(30),
        };

        Ok(Self {
            tcp_handshake_port: port(&lookup, "TCP_HANDSHAKE_PORT", 46000)?,
            udp_gcs_rx: port(&lookup, "UDP_GCS_RX", 46011)?,
            udp_drone_rx: port(&lookup, "UDP_DRONE_RX", 46012)?,
            gcs_plaintext_tx: port(&lookup, "GCS_PLAINTEXT_TX", 47001)?,
            gcs_plaintext_rx: port(&lookup, "GCS_PLAINTEXT_RX", 47002)?,
            drone_plaintext_tx: port(&lookup, "DRONE_PLAINTEXT_TX", 47003)?,
            drone_plaintext_rx: port(&lookup, "DRONE_PLAINTEXT_RX", 47004)?,
            gcs_host: host(&lookup, "GCS_HOST")?,
            drone_host: host(&lookup, "DRONE_HOST")?,
            replay_window,
            psk,
            handshake_timeout,
        })
    }
}

fn port(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u16,
) -> Result<u16, Error> {
    match lookup(key) {
        Some(v) => v
            .trim()
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("{key} is not a valid port: {v}"))),
        None => Ok(default),
    }
}

fn host(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<IpAddr, Error> {
    match lookup(key) {
        Some(v) => v
            .trim()
            .parse::<IpAddr>()
            .map_err(|_| Error::Config(format!("{key} is not a valid address: {v}"))),
        None => Ok(IpAddr::from([127, 0, 0, 1])),
    }
}
