//! Proxy counters.
//!
//! Single shared owner behind one lock; readers get snapshot copies. The
//! snapshot serializes to the summary JSON emitted on demand and at
//! shutdown.

use std::sync::Mutex;

use serde::Serialize;

use crate::framing::DropReason;

/// Snapshot-consistent view of every counter.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub ptx_in: u64,
    pub ptx_out: u64,
    pub enc_in: u64,
    pub enc_out: u64,
    pub drops: u64,
    pub drop_auth: u64,
    pub drop_header: u64,
    pub drop_replay: u64,
    pub drop_session_epoch: u64,
    pub drop_other: u64,
    pub rekeys_ok: u64,
    pub rekeys_fail: u64,
    pub last_rekey_suite: Option<String>,
}

/// Monotonic tunnel counters. All writes are serialized behind one lock.
#[derive(Debug, Default)]
pub struct ProxyCounters {
    inner: Mutex<CountersSnapshot>,
}

impl ProxyCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut CountersSnapshot) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner)
    }

    /// Plaintext datagram accepted from the local application.
    pub fn add_ptx_in(&self) {
        self.with(|c| c.ptx_in += 1);
    }

    /// Decrypted datagram delivered to the local application.
    pub fn add_ptx_out(&self) {
        self.with(|c| c.ptx_out += 1);
    }

    /// Encrypted datagram accepted from the network.
    pub fn add_enc_in(&self) {
        self.with(|c| c.enc_in += 1);
    }

    /// Encrypted datagram emitted to the network.
    pub fn add_enc_out(&self) {
        self.with(|c| c.enc_out += 1);
    }

    /// Classify and count one dropped datagram.
    ///
    /// `Session` and `SessionEpoch` share the session/epoch bucket; the
    /// finer-grained reason stays internal to the receiver.
    pub fn record_drop(&self, reason: DropReason) {
        self.with(|c| {
            c.drops += 1;
            match reason {
                DropReason::Auth => c.drop_auth += 1,
                DropReason::Header => c.drop_header += 1,
                DropReason::Replay => c.drop_replay += 1,
                DropReason::Session | DropReason::SessionEpoch => c.drop_session_epoch += 1,
                DropReason::Other => c.drop_other += 1,
            }
        });
    }

    /// A two-phase rekey completed and the context swapped.
    pub fn record_rekey_ok(&self, suite_id: &str) {
        self.with(|c| {
            c.rekeys_ok += 1;
            c.last_rekey_suite = Some(suite_id.to_string());
        });
    }

    /// A rekey attempt failed at any phase.
    pub fn record_rekey_fail(&self) {
        self.with(|c| c.rekeys_fail += 1);
    }

    /// Snapshot-consistent copy of every counter.
    pub fn snapshot(&self) -> CountersSnapshot {
        self.with(|c| c.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_buckets() {
        let c = ProxyCounters::new();
        c.record_drop(DropReason::Auth);
        c.record_drop(DropReason::Replay);
        c.record_drop(DropReason::Session);
        c.record_drop(DropReason::SessionEpoch);
        c.record_drop(DropReason::Header);
        c.record_drop(DropReason::Other);
        let s = c.snapshot();
        assert_eq!(s.drops, 6);
        assert_eq!(s.drop_auth, 1);
        assert_eq!(s.drop_replay, 1);
        assert_eq!(s.drop_session_epoch, 2);
        assert_eq!(s.drop_header, 1);
        assert_eq!(s.drop_other, 1);
    }

    #[test]
    fn rekey_outcome_recorded() {
        let c = ProxyCounters::new();
        c.record_rekey_fail();
        c.record_rekey_ok("cs-mlkem1024-aesgcm-mldsa87");
        let s = c.snapshot();
        assert_eq!(s.rekeys_ok, 1);
        assert_eq!(s.rekeys_fail, 1);
        assert_eq!(s.last_rekey_suite.as_deref(), Some("cs-mlkem1024-aesgcm-mldsa87"));
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let c = ProxyCounters::new();
        c.add_ptx_in();
        c.add_enc_out();
        let json = serde_json::to_value(c.snapshot()).unwrap();
        assert_eq!(json["ptx_in"], 1);
        assert_eq!(json["enc_out"], 1);
        assert_eq!(json["last_rekey_suite"], serde_json::Value::Null);
    }
}
