//! In-band rekey/control protocol.
//!
//! Control messages ride the encrypted channel as `packet_type 0x02`
//! payloads, so their origin is already authenticated by the session AEAD.
//! The engine here is a pure state machine: the orchestrator feeds it
//! decrypted control messages and executes the actions it returns (send a
//! reply, run the swap-phase handshake, give up). All socket and handshake
//! I/O stays in the orchestrator.
//!
//! Two-phase commit: `prepare_rekey` -> `commit_rekey` (nonce echoed),
//! then both sides run a fresh handshake with the target suite and swap
//! the session context atomically, advancing the epoch by one.
//!
//! Default policy: only the GCS initiates. A `prepare_rekey` arriving at
//! the GCS is answered with `prepare_fail("unauthorized")`.

use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::Role;
use crate::errors::{Error, RekeyError};
use crate::suites;

/// Preparation phase budget.
pub const PREPARE_TIMEOUT: Duration = Duration::from_secs(30);

/// Swap phase budget (handshake + context replacement).
pub const SWAP_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum accepted clock skew on control-message timestamps.
pub const MAX_CONTROL_AGE_SECS: i64 = 300;

/* ============================================================================
 * Messages
 * ========================================================================== */

/// Control message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlKind {
    PrepareRekey,
    CommitRekey,
    PrepareFail,
    RekeyComplete,
}

/// Typed record carried inside the AEAD plaintext of a 0x02 packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMsg {
    pub kind: ControlKind,
    pub target_suite: String,
    /// Fresh on prepare, echoed verbatim on commit. Defends against
    /// replay of stale prepare/commit within the same epoch.
    pub nonce: [u8; 8],
    /// Unix seconds at send time.
    pub ts: i64,
    /// Reason (PrepareFail) or status (RekeyComplete); empty otherwise.
    pub extra: Vec<u8>,
}

impl ControlMsg {
    fn new(kind: ControlKind, target_suite: &str, nonce: [u8; 8], now_ts: i64) -> Self {
        Self { kind, target_suite: target_suite.to_string(), nonce, ts: now_ts, extra: Vec::new() }
    }

    fn with_extra(mut self, extra: &str) -> Self {
        self.extra = extra.as_bytes().to_vec();
        self
    }

    /// Reason/status text carried in `extra`.
    pub fn extra_text(&self) -> String {
        String::from_utf8_lossy(&self.extra).into_owned()
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        bincode::serialize(self)
            .map_err(|e| Error::HandshakeFormat(format!("control encode: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::HandshakeFormat(format!("control decode: {e}")))
    }
}

/* ============================================================================
 * State machine
 * ========================================================================== */

/// Per-endpoint rekey state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Running,
    Negotiating,
    Swapping,
    Failed,
}

/// What the orchestrator must do after feeding the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    /// Nothing.
    None,
    /// Send this message on the encrypted channel.
    Reply(ControlMsg),
    /// Responder path: send `reply`, then run the swap-phase handshake
    /// toward `target_suite`.
    Commit { reply: ControlMsg, target_suite: String },
    /// Initiator path: peer committed; run the swap-phase handshake.
    Swap { target_suite: String },
    /// Initiator path: the prepare phase failed.
    Failed { reason: String },
    /// Peer reported its rekey outcome (informational).
    Completed { status: String },
}

/// Rekey state machine for one endpoint.
pub struct ControlEngine {
    role: Role,
    state: ControlState,
    pending: Option<Pending>,
}

struct Pending {
    target_suite: String,
    nonce: [u8; 8],
    since: Instant,
}

impl ControlEngine {
    pub fn new(role: Role) -> Self {
        Self { role, state: ControlState::Running, pending: None }
    }

    pub fn state(&self) -> ControlState {
        self.state
    }

    /// Initiator entry point. Validates the target locally, emits the
    /// `prepare_rekey` to send and moves to `Negotiating`.
    pub fn start_prepare(&mut self, target_suite: &str, now_ts: i64) -> Result<ControlMsg, Error> {
        if self.role != Role::Gcs {
            return Err(RekeyError::Unauthorized.into());
        }
        if self.state != ControlState::Running && self.state != ControlState::Failed {
            return Err(RekeyError::PrepareFailed("rekey already in progress".into()).into());
        }
        suites::get(target_suite)?;

        let mut nonce = [0u8; 8];
        OsRng.fill_bytes(&mut nonce);
        self.pending = Some(Pending {
            target_suite: target_suite.to_string(),
            nonce,
            since: Instant::now(),
        });
        self.state = ControlState::Negotiating;
        Ok(ControlMsg::new(ControlKind::PrepareRekey, target_suite, nonce, now_ts))
    }

    /// Has the outstanding prepare exceeded its budget?
    pub fn prepare_expired(&self, now: Instant) -> bool {
        self.state == ControlState::Negotiating
            && self
                .pending
                .as_ref()
                .is_some_and(|p| now.duration_since(p.since) >= PREPARE_TIMEOUT)
    }

    /// Initiator gave up waiting for the commit.
    pub fn abort_prepare(&mut self) {
        if self.state == ControlState::Negotiating {
            self.pending = None;
            self.state = ControlState::Running;
        }
    }

    /// The swap-phase handshake finished and the context was replaced.
    pub fn swap_succeeded(&mut self) {
        self.pending = None;
        self.state = ControlState::Running;
    }

    /// The swap-phase handshake failed.
    pub fn swap_failed(&mut self) {
        self.pending = None;
        self.state = ControlState::Failed;
    }

    /// Responder failure recovery: keep the old context, accept future
    /// prepares again.
    pub fn reset_to_running(&mut self) {
        self.pending = None;
        self.state = ControlState::Running;
    }

    /// Feed one decrypted control message. `supports` answers whether this
    /// endpoint holds the key material for a suite's signature scheme.
    pub fn on_message(
        &mut self,
        msg: &ControlMsg,
        supports: impl Fn(&suites::Suite) -> bool,
        now_ts: i64,
    ) -> ControlAction {
        match msg.kind {
            ControlKind::PrepareRekey => self.on_prepare(msg, supports, now_ts),
            ControlKind::CommitRekey => self.on_commit(msg),
            ControlKind::PrepareFail => self.on_prepare_fail(msg),
            ControlKind::RekeyComplete => ControlAction::Completed { status: msg.extra_text() },
        }
    }

    fn on_prepare(
        &mut self,
        msg: &ControlMsg,
        supports: impl Fn(&suites::Suite) -> bool,
        now_ts: i64,
    ) -> ControlAction {
        let fail = |reason: &str| {
            ControlAction::Reply(
                ControlMsg::new(ControlKind::PrepareFail, &msg.target_suite, msg.nonce, now_ts)
                    .with_extra(reason),
            )
        };

        // Only the GCS may initiate; a prepare arriving at the GCS came
        // from the drone.
        if self.role == Role::Gcs {
            return fail("unauthorized");
        }
        if self.state == ControlState::Negotiating || self.state == ControlState::Swapping {
            return fail("busy");
        }
        if (now_ts - msg.ts).abs() > MAX_CONTROL_AGE_SECS {
            return fail("stale");
        }
        let suite = match suites::get(&msg.target_suite) {
            Ok(s) => s,
            Err(_) => return fail("unknown suite"),
        };
        if !supports(suite) {
            return fail("unsupported suite");
        }

        self.state = ControlState::Swapping;
        let reply =
            ControlMsg::new(ControlKind::CommitRekey, &msg.target_suite, msg.nonce, now_ts);
        ControlAction::Commit { reply, target_suite: msg.target_suite.clone() }
    }

    fn on_commit(&mut self, msg: &ControlMsg) -> ControlAction {
        if self.state != ControlState::Negotiating {
            return ControlAction::None;
        }
        let Some(pending) = self.pending.as_ref() else {
            return ControlAction::None;
        };
        if pending.nonce != msg.nonce || pending.target_suite != msg.target_suite {
            // Stale or cross-attempt commit: ignore, keep waiting.
            return ControlAction::None;
        }
        self.state = ControlState::Swapping;
        ControlAction::Swap { target_suite: msg.target_suite.clone() }
    }

    fn on_prepare_fail(&mut self, msg: &ControlMsg) -> ControlAction {
        if self.state != ControlState::Negotiating {
            return ControlAction::None;
        }
        self.pending = None;
        self.state = ControlState::Running;
        ControlAction::Failed { reason: msg.extra_text() }
    }
}

/// Build the `rekey_complete` notification sent after a swap.
pub fn rekey_complete(target_suite: &str, status: &str, now_ts: i64) -> ControlMsg {
    ControlMsg::new(ControlKind::RekeyComplete, target_suite, [0u8; 8], now_ts).with_extra(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "cs-mlkem1024-aesgcm-mldsa87";
    const NOW: i64 = 1_700_000_000;

    fn engines() -> (ControlEngine, ControlEngine) {
        (ControlEngine::new(Role::Gcs), ControlEngine::new(Role::Drone))
    }

    #[test]
    fn two_phase_happy_path() {
        let (mut gcs, mut drone) = engines();

        let prepare = gcs.start_prepare(TARGET, NOW).unwrap();
        assert_eq!(gcs.state(), ControlState::Negotiating);

        let action = drone.on_message(&prepare, |_| true, NOW + 1);
        let ControlAction::Commit { reply, target_suite } = action else {
            panic!("expected commit, got {action:?}");
        };
        assert_eq!(target_suite, TARGET);
        assert_eq!(reply.nonce, prepare.nonce);
        assert_eq!(drone.state(), ControlState::Swapping);

        let action = gcs.on_message(&reply, |_| true, NOW + 1);
        assert_eq!(action, ControlAction::Swap { target_suite: TARGET.into() });
        assert_eq!(gcs.state(), ControlState::Swapping);

        gcs.swap_succeeded();
        drone.swap_succeeded();
        assert_eq!(gcs.state(), ControlState::Running);
        assert_eq!(drone.state(), ControlState::Running);
    }

    #[test]
    fn drone_cannot_initiate() {
        let (mut gcs, mut drone) = engines();
        assert!(matches!(
            drone.start_prepare(TARGET, NOW),
            Err(Error::Rekey(RekeyError::Unauthorized))
        ));

        // A prepare that reaches the GCS anyway is rejected on the wire.
        let forged = ControlMsg::new(ControlKind::PrepareRekey, TARGET, [1; 8], NOW);
        let action = gcs.on_message(&forged, |_| true, NOW);
        let ControlAction::Reply(reply) = action else { panic!("expected reply") };
        assert_eq!(reply.kind, ControlKind::PrepareFail);
        assert_eq!(reply.extra_text(), "unauthorized");
        assert_eq!(gcs.state(), ControlState::Running);
    }

    #[test]
    fn unknown_and_unsupported_suites_rejected() {
        let (_, mut drone) = engines();
        let prepare = ControlMsg::new(ControlKind::PrepareRekey, "cs-nope", [1; 8], NOW);
        let ControlAction::Reply(reply) = drone.on_message(&prepare, |_| true, NOW) else {
            panic!("expected reply")
        };
        assert_eq!(reply.extra_text(), "unknown suite");

        let prepare = ControlMsg::new(ControlKind::PrepareRekey, TARGET, [1; 8], NOW);
        let ControlAction::Reply(reply) = drone.on_message(&prepare, |_| false, NOW) else {
            panic!("expected reply")
        };
        assert_eq!(reply.extra_text(), "unsupported suite");
        assert_eq!(drone.state(), ControlState::Running);
    }

    #[test]
    fn stale_prepare_rejected() {
        let (_, mut drone) = engines();
        let prepare = ControlMsg::new(ControlKind::PrepareRekey, TARGET, [1; 8], NOW);
        let action = drone.on_message(&prepare, |_| true, NOW + MAX_CONTROL_AGE_SECS + 1);
        let ControlAction::Reply(reply) = action else { panic!("expected reply") };
        assert_eq!(reply.extra_text(), "stale");
    }

    #[test]
    fn commit_nonce_echo_must_match() {
        let (mut gcs, _) = engines();
        let prepare = gcs.start_prepare(TARGET, NOW).unwrap();

        let mut wrong = ControlMsg::new(ControlKind::CommitRekey, TARGET, prepare.nonce, NOW);
        wrong.nonce[0] ^= 1;
        assert_eq!(gcs.on_message(&wrong, |_| true, NOW), ControlAction::None);
        assert_eq!(gcs.state(), ControlState::Negotiating);

        let right = ControlMsg::new(ControlKind::CommitRekey, TARGET, prepare.nonce, NOW);
        assert!(matches!(gcs.on_message(&right, |_| true, NOW), ControlAction::Swap { .. }));
    }

    #[test]
    fn prepare_fail_returns_initiator_to_running() {
        let (mut gcs, _) = engines();
        let prepare = gcs.start_prepare(TARGET, NOW).unwrap();
        let fail = ControlMsg::new(ControlKind::PrepareFail, TARGET, prepare.nonce, NOW)
            .with_extra("busy");
        let action = gcs.on_message(&fail, |_| true, NOW);
        assert_eq!(action, ControlAction::Failed { reason: "busy".into() });
        assert_eq!(gcs.state(), ControlState::Running);
    }

    #[test]
    fn busy_responder_rejects_second_prepare() {
        let (_, mut drone) = engines();
        let p1 = ControlMsg::new(ControlKind::PrepareRekey, TARGET, [1; 8], NOW);
        assert!(matches!(drone.on_message(&p1, |_| true, NOW), ControlAction::Commit { .. }));
        let p2 = ControlMsg::new(ControlKind::PrepareRekey, TARGET, [2; 8], NOW);
        let ControlAction::Reply(reply) = drone.on_message(&p2, |_| true, NOW) else {
            panic!("expected reply")
        };
        assert_eq!(reply.extra_text(), "busy");
    }

    #[test]
    fn prepare_timeout_detected() {
        let (mut gcs, _) = engines();
        gcs.start_prepare(TARGET, NOW).unwrap();
        let now = Instant::now();
        assert!(!gcs.prepare_expired(now));
        assert!(gcs.prepare_expired(now + PREPARE_TIMEOUT + Duration::from_secs(1)));
        gcs.abort_prepare();
        assert_eq!(gcs.state(), ControlState::Running);
    }

    #[test]
    fn failed_state_accepts_recovery_prepare() {
        let (_, mut drone) = engines();
        let p = ControlMsg::new(ControlKind::PrepareRekey, TARGET, [1; 8], NOW);
        assert!(matches!(drone.on_message(&p, |_| true, NOW), ControlAction::Commit { .. }));
        drone.swap_failed();
        assert_eq!(drone.state(), ControlState::Failed);
        let p = ControlMsg::new(ControlKind::PrepareRekey, TARGET, [2; 8], NOW);
        assert!(matches!(drone.on_message(&p, |_| true, NOW), ControlAction::Commit { .. }));
    }

    #[test]
    fn message_encoding_roundtrip() {
        let msg = ControlMsg::new(ControlKind::PrepareRekey, TARGET, [9; 8], NOW);
        let decoded = ControlMsg::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, ControlKind::PrepareRekey);
        assert_eq!(decoded.target_suite, TARGET);
        assert_eq!(decoded.nonce, [9; 8]);
        assert_eq!(decoded.ts, NOW);
        assert!(ControlMsg::decode(&[0xff, 0xee]).is_err());
    }
}
