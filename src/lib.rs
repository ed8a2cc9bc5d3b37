//! pq-drone-gcs: post-quantum authenticated UDP tunnel between a ground
//! control station and a drone.
//!
//! Plaintext UDP traffic from a local application is intercepted on
//! loopback, sealed with AES-256-GCM under keys derived from a post-quantum
//! handshake (ML-KEM + a signed transcript + PSK), relayed over a network
//! UDP channel and decrypted back onto the peer's loopback. An in-band
//! control protocol rekeys the tunnel to a different suite without tearing
//! it down.

#![forbid(unsafe_code)]

pub mod config;
pub mod control;
pub mod counters;
pub mod errors;
pub mod framing;
pub mod handshake;
pub mod kem;
pub mod keys;
pub mod proxy;
pub mod replay;
pub mod session;
pub mod sig;
pub mod suites;

pub use config::{Config, Psk, Role};
pub use counters::{CountersSnapshot, ProxyCounters};
pub use errors::{Error, RekeyError};
pub use framing::{DropReason, PKT_CONTROL, PKT_DATA, WIRE_VERSION};
pub use keys::SigKeyStore;
pub use proxy::{BoundAddrs, Proxy, ProxyHandle};
pub use session::{Session, SessionContext, SessionSnapshot};
pub use suites::Suite;
