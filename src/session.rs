//! Session context: the single owner of all per-session cryptographic
//! state, and the only place where replacement on rekey happens.

use std::sync::Mutex;

use serde::Serialize;
use zeroize::Zeroizing;

use crate::errors::Error;
use crate::framing::{DropReason, Receiver, Sender};
use crate::replay::ReplayWindow;
use crate::suites::{self, Suite};

/// Directional key material produced by the handshake key schedule.
pub struct DirectionalKeys {
    pub send: Zeroizing<[u8; 32]>,
    pub recv: Zeroizing<[u8; 32]>,
}

/// All cryptographic state of one established session.
pub struct SessionContext {
    suite: &'static Suite,
    session_id: [u8; 8],
    epoch: u8,
    sender: Sender,
    receiver: Receiver,
}

impl std::fmt::Debug for SessionContext {
    // Manual impl: `Sender`/`Receiver` hold an `Aes256Gcm` cipher which does
    // not implement `Debug`, so key material is never at risk of being
    // printed here.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("suite", &self.suite.suite_id)
            .field("session_id", &self.session_id)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl SessionContext {
    pub fn new(
        suite: &'static Suite,
        session_id: [u8; 8],
        epoch: u8,
        keys: DirectionalKeys,
        replay_window: usize,
    ) -> Result<Self, Error> {
        let ids = suites::header_ids(suite);
        let window = ReplayWindow::new(replay_window)?;
        Ok(Self {
            suite,
            session_id,
            epoch,
            sender: Sender::new(&keys.send, session_id, ids, epoch),
            receiver: Receiver::new(&keys.recv, session_id, ids, epoch, window),
        })
    }

    pub fn suite(&self) -> &'static Suite {
        self.suite
    }

    pub fn session_id(&self) -> [u8; 8] {
        self.session_id
    }

    pub fn epoch(&self) -> u8 {
        self.epoch
    }
}

/// Observer view of the active session.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub suite_id: String,
    pub session_id: String,
    pub epoch: u8,
    pub send_seq: u64,
}

/// Shared handle around the active [`SessionContext`].
///
/// One mutex serializes sends, receives and swaps. The critical sections
/// are synchronous crypto with no await points, so the lock is a plain
/// `std::sync::Mutex` held per datagram.
pub struct Session {
    inner: Mutex<SessionContext>,
}

impl Session {
    pub fn new(ctx: SessionContext) -> Self {
        Self { inner: Mutex::new(ctx) }
    }

    fn with<R>(&self, f: impl FnOnce(&mut SessionContext) -> R) -> R {
        let mut ctx = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut ctx)
    }

    /// Seal one outbound datagram under the current context.
    pub fn encrypt(&self, packet_type: u8, payload: &[u8]) -> Result<Vec<u8>, Error> {
        self.with(|ctx| ctx.sender.encrypt(packet_type, payload))
    }

    /// Open one inbound datagram under the current context. On drop, the
    /// classification is returned instead of the payload.
    pub fn decrypt(&self, wire: &[u8]) -> Result<(u8, Vec<u8>), DropReason> {
        self.with(|ctx| match ctx.receiver.decrypt(wire) {
            Some(out) => Ok(out),
            None => Err(ctx.receiver.last_drop().unwrap_or(DropReason::Other)),
        })
    }

    /// Atomically replace the whole cryptographic state. After return, no
    /// operation uses any key, sequence or window of the old context.
    pub fn swap(&self, new_ctx: SessionContext) {
        self.with(|ctx| *ctx = new_ctx);
    }

    /// Current suite of the active context.
    pub fn suite(&self) -> &'static Suite {
        self.with(|ctx| ctx.suite)
    }

    /// Current epoch of the active context.
    pub fn epoch(&self) -> u8 {
        self.with(|ctx| ctx.epoch)
    }

    /// Snapshot of the observable session state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.with(|ctx| SessionSnapshot {
            suite_id: ctx.suite.suite_id.to_string(),
            session_id: hex::encode(ctx.session_id),
            epoch: ctx.epoch,
            send_seq: ctx.sender.send_seq(),
        })
    }
}
