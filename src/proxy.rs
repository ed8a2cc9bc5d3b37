//! Proxy orchestrator: the composition root.
//!
//! Binds the handshake TCP socket, the network-facing encrypted UDP socket
//! and the loopback plaintext UDP socket, runs the handshake once, then
//! forwards datagrams in both directions while a third task drives the
//! control/rekey protocol. One [`Session`] mutex totally orders context
//! swaps against both directions; everything else is message passing.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, Psk, Role};
use crate::control::{
    self, ControlAction, ControlEngine, ControlMsg, SWAP_TIMEOUT,
};
use crate::counters::{CountersSnapshot, ProxyCounters};
use crate::errors::{Error, RekeyError};
use crate::framing::{DropReason, PKT_CONTROL, PKT_DATA};
use crate::handshake;
use crate::keys::SigKeyStore;
use crate::session::{Session, SessionContext, SessionSnapshot};
use crate::suites::{self, Suite};

/// Handshake connect attempts before giving up (client role).
const CONNECT_ATTEMPTS: u32 = 5;

/// Largest UDP datagram we handle.
const DATAGRAM_MAX: usize = 64 * 1024;

/// Addresses actually bound at startup, for observers and tests.
#[derive(Debug, Clone)]
pub struct BoundAddrs {
    pub handshake: SocketAddr,
    pub encrypted: SocketAddr,
    pub plaintext: SocketAddr,
}

/// One configured but not yet started proxy endpoint.
pub struct Proxy {
    role: Role,
    suite: &'static Suite,
    config: Config,
    keys: Arc<SigKeyStore>,
}

struct RekeyRequest {
    target: String,
    done: Option<oneshot::Sender<Result<(), Error>>>,
}

impl Proxy {
    /// Validate the suite and key material for `role` up front.
    pub fn new(role: Role, suite_id: &str, config: Config, keys: SigKeyStore) -> Result<Self, Error> {
        let suite = suites::get(suite_id)?;
        let has_material = match role {
            Role::Gcs => keys.signing_for(suite.sig_name).is_some(),
            Role::Drone => keys.verifying_for(suite.sig_name).is_some(),
        };
        if !has_material {
            return Err(Error::Config(format!(
                "missing {} key material for {}",
                match role {
                    Role::Gcs => "signing",
                    Role::Drone => "verifying",
                },
                suite.sig_name
            )));
        }
        Ok(Self { role, suite, config, keys: Arc::new(keys) })
    }

    /// Run the startup handshake, bind the data-plane sockets and spawn the
    /// forwarding and control tasks.
    pub async fn start(self) -> Result<ProxyHandle, Error> {
        let counters = Arc::new(ProxyCounters::new());
        let stage_timeout = self.config.handshake_timeout;
        let window = self.config.replay_window;

        let (ctx, transport, handshake_addr) = match self.role {
            Role::Gcs => {
                let bind = SocketAddr::new(
                    unspecified_like(self.config.gcs_host),
                    self.config.tcp_handshake_port,
                );
                let listener = TcpListener::bind(bind).await?;
                let local = listener.local_addr()?;
                info!(addr = %local, "handshake listener up, waiting for drone");
                let (mut stream, peer) = listener.accept().await?;
                info!(peer = %peer, "drone connected, running handshake");
                let ctx = handshake::server_handshake(
                    &mut stream,
                    self.suite,
                    &self.keys,
                    &self.config.psk,
                    0,
                    window,
                    stage_timeout,
                )
                .await?;
                (ctx, SwapTransport::Listener(listener), local)
            }
            Role::Drone => {
                let addr =
                    SocketAddr::new(self.config.gcs_host, self.config.tcp_handshake_port);
                let ctx = connect_with_backoff(
                    addr,
                    self.suite,
                    &self.keys,
                    &self.config.psk,
                    window,
                    stage_timeout,
                )
                .await?;
                (ctx, SwapTransport::Connect(addr), addr)
            }
        };
        info!(
            suite = self.suite.suite_id,
            session = %hex::encode(ctx.session_id()),
            "handshake complete"
        );

        let (enc_rx_port, ptx_rx_port, ptx_tx_port, peer) = match self.role {
            Role::Gcs => (
                self.config.udp_gcs_rx,
                self.config.gcs_plaintext_rx,
                self.config.gcs_plaintext_tx,
                SocketAddr::new(self.config.drone_host, self.config.udp_drone_rx),
            ),
            Role::Drone => (
                self.config.udp_drone_rx,
                self.config.drone_plaintext_rx,
                self.config.drone_plaintext_tx,
                SocketAddr::new(self.config.gcs_host, self.config.udp_gcs_rx),
            ),
        };
        let encrypted = Arc::new(
            UdpSocket::bind(SocketAddr::new(unspecified_like(peer.ip()), enc_rx_port)).await?,
        );
        let plaintext = Arc::new(
            UdpSocket::bind(SocketAddr::from(([127, 0, 0, 1], ptx_rx_port))).await?,
        );
        let plaintext_egress = SocketAddr::from(([127, 0, 0, 1], ptx_tx_port));
        let local = BoundAddrs {
            handshake: handshake_addr,
            encrypted: encrypted.local_addr()?,
            plaintext: plaintext.local_addr()?,
        };

        let session = Arc::new(Session::new(ctx));
        let cancel = CancellationToken::new();
        let (ctrl_tx, ctrl_rx) = mpsc::channel::<Vec<u8>>(64);
        let (rekey_tx, rekey_rx) = mpsc::channel::<RekeyRequest>(4);

        let mut tasks: JoinSet<Result<(), Error>> = JoinSet::new();
        tasks.spawn(outbound_loop(
            plaintext.clone(),
            encrypted.clone(),
            peer,
            session.clone(),
            counters.clone(),
            self.role,
            rekey_tx.clone(),
            cancel.clone(),
        ));
        tasks.spawn(inbound_loop(
            encrypted.clone(),
            plaintext.clone(),
            plaintext_egress,
            peer,
            session.clone(),
            counters.clone(),
            ctrl_tx,
            cancel.clone(),
        ));
        let control_task = ControlTask {
            engine: ControlEngine::new(self.role),
            session: session.clone(),
            counters: counters.clone(),
            keys: self.keys.clone(),
            psk: self.config.psk.clone(),
            encrypted: encrypted.clone(),
            peer,
            transport,
            replay_window: window,
            stage_timeout,
            pending: None,
            cancel: cancel.clone(),
        };
        tasks.spawn(control_task.run(ctrl_rx, rekey_rx));

        let supervisor = tokio::spawn(supervise(tasks, cancel.clone(), counters.clone()));

        Ok(ProxyHandle { counters, session, cancel, rekey_tx, supervisor, local })
    }
}

/// Live handle onto a running proxy. This is the interface a rekey
/// scheduler or embedding process talks to.
pub struct ProxyHandle {
    counters: Arc<ProxyCounters>,
    session: Arc<Session>,
    cancel: CancellationToken,
    rekey_tx: mpsc::Sender<RekeyRequest>,
    supervisor: JoinHandle<Result<(), Error>>,
    pub local: BoundAddrs,
}

impl ProxyHandle {
    /// Snapshot of all counters.
    pub fn counters_snapshot(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    /// Snapshot of the active session (suite, epoch, session id, seq).
    pub fn session_snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Drive one two-phase rekey to `target_suite` and wait for its
    /// outcome. GCS role only; the drone side rejects with `unauthorized`.
    pub async fn request_rekey(&self, target_suite: &str) -> Result<(), Error> {
        let (done, outcome) = oneshot::channel();
        self.rekey_tx
            .send(RekeyRequest { target: target_suite.to_string(), done: Some(done) })
            .await
            .map_err(|_| Error::from(RekeyError::SwapFailed))?;
        outcome.await.map_err(|_| Error::from(RekeyError::SwapFailed))?
    }

    /// Signal every task to stop.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Wait for the proxy to finish; returns the final counters.
    pub async fn join(self) -> Result<CountersSnapshot, Error> {
        match self.supervisor.await {
            Ok(result) => result?,
            Err(e) => return Err(Error::Io(io::Error::new(io::ErrorKind::Other, e))),
        }
        Ok(self.counters.snapshot())
    }

    /// Stop and wait, returning the final counters.
    pub async fn shutdown(self) -> Result<CountersSnapshot, Error> {
        self.cancel.cancel();
        self.join().await
    }
}

fn unspecified_like(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Client-role handshake, capped attempts with exponential backoff
/// (1, 2, 4, 8 s between tries).
async fn connect_with_backoff(
    addr: SocketAddr,
    suite: &'static Suite,
    keys: &SigKeyStore,
    psk: &Psk,
    replay_window: usize,
    stage_timeout: Duration,
) -> Result<SessionContext, Error> {
    let mut last_err = Error::HandshakeTimeout;
    for attempt in 0..CONNECT_ATTEMPTS {
        if attempt > 0 {
            let backoff = Duration::from_secs(1 << (attempt - 1));
            debug!(?backoff, attempt, "handshake retry");
            sleep(backoff).await;
        }
        let result = async {
            let mut stream = TcpStream::connect(addr).await?;
            handshake::client_handshake(
                &mut stream,
                suite,
                keys,
                psk,
                0,
                replay_window,
                stage_timeout,
            )
            .await
        }
        .await;
        match result {
            Ok(ctx) => return Ok(ctx),
            Err(e) => {
                warn!(attempt, error = %e, "handshake attempt failed");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/* ============================================================================
 * Forwarding tasks
 * ========================================================================== */

#[allow(clippy::too_many_arguments)]
async fn outbound_loop(
    plaintext: Arc<UdpSocket>,
    encrypted: Arc<UdpSocket>,
    peer: SocketAddr,
    session: Arc<Session>,
    counters: Arc<ProxyCounters>,
    role: Role,
    rekey_tx: mpsc::Sender<RekeyRequest>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let mut buf = vec![0u8; DATAGRAM_MAX];
    loop {
        let (len, _src) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = plaintext.recv_from(&mut buf) => r?,
        };
        counters.add_ptx_in();
        match session.encrypt(PKT_DATA, &buf[..len]) {
            Ok(wire) => match encrypted.send_to(&wire, peer).await {
                Ok(_) => counters.add_enc_out(),
                Err(e) => {
                    warn!(error = %e, "encrypted egress failed");
                    counters.record_drop(DropReason::Other);
                }
            },
            Err(Error::SequenceExhausted) => {
                counters.record_drop(DropReason::Other);
                match role {
                    // The GCS can recover in-band: schedule a rekey on the
                    // current suite and keep dropping until it lands.
                    Role::Gcs => {
                        warn!("send sequence exhausted, requesting rekey");
                        let target = session.suite().suite_id.to_string();
                        let _ = rekey_tx.try_send(RekeyRequest { target, done: None });
                    }
                    Role::Drone => return Err(Error::SequenceExhausted),
                }
            }
            Err(e) => {
                warn!(error = %e, "encrypt failed");
                counters.record_drop(DropReason::Other);
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn inbound_loop(
    encrypted: Arc<UdpSocket>,
    plaintext: Arc<UdpSocket>,
    plaintext_egress: SocketAddr,
    peer: SocketAddr,
    session: Arc<Session>,
    counters: Arc<ProxyCounters>,
    ctrl_tx: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) -> Result<(), Error> {
    let mut buf = vec![0u8; DATAGRAM_MAX];
    loop {
        let (len, from) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = encrypted.recv_from(&mut buf) => r?,
        };
        if from != peer {
            counters.record_drop(DropReason::Other);
            continue;
        }
        match session.decrypt(&buf[..len]) {
            Err(reason) => counters.record_drop(reason),
            Ok((PKT_DATA, payload)) => {
                counters.add_enc_in();
                // Non-blocking egress: the application layer is UDP, a
                // full socket buffer means the datagram is lost.
                match plaintext.try_send_to(&payload, plaintext_egress) {
                    Ok(_) => counters.add_ptx_out(),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        counters.record_drop(DropReason::Other);
                    }
                    Err(e) => {
                        debug!(error = %e, "plaintext egress failed");
                        counters.record_drop(DropReason::Other);
                    }
                }
            }
            Ok((PKT_CONTROL, payload)) => {
                if ctrl_tx.send(payload).await.is_err() {
                    return Ok(());
                }
            }
            Ok((_, _)) => counters.record_drop(DropReason::Other),
        }
    }
}

async fn supervise(
    mut tasks: JoinSet<Result<(), Error>>,
    cancel: CancellationToken,
    counters: Arc<ProxyCounters>,
) -> Result<(), Error> {
    let mut result = Ok(());
    while let Some(joined) = tasks.join_next().await {
        // First exit, clean or not, ends the tunnel.
        cancel.cancel();
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if result.is_ok() {
                    error!(error = %e, "tunnel task failed");
                    result = Err(e);
                }
            }
            Err(e) => {
                if result.is_ok() {
                    result = Err(Error::Io(io::Error::new(io::ErrorKind::Other, e)));
                }
            }
        }
    }
    let summary = serde_json::to_string(&counters.snapshot()).unwrap_or_default();
    info!(%summary, "tunnel stopped");
    result
}

/* ============================================================================
 * Control task
 * ========================================================================== */

enum SwapTransport {
    /// GCS keeps its handshake listener open for rekey connections.
    Listener(TcpListener),
    /// Drone reconnects to the GCS handshake endpoint.
    Connect(SocketAddr),
}

struct PendingRekey {
    target: String,
    prior: String,
    done: Option<oneshot::Sender<Result<(), Error>>>,
    is_rollback: bool,
}

struct ControlTask {
    engine: ControlEngine,
    session: Arc<Session>,
    counters: Arc<ProxyCounters>,
    keys: Arc<SigKeyStore>,
    psk: Psk,
    encrypted: Arc<UdpSocket>,
    peer: SocketAddr,
    transport: SwapTransport,
    replay_window: usize,
    stage_timeout: Duration,
    pending: Option<PendingRekey>,
    cancel: CancellationToken,
}

fn respond(done: Option<oneshot::Sender<Result<(), Error>>>, outcome: Result<(), Error>) {
    if let Some(tx) = done {
        let _ = tx.send(outcome);
    }
}

impl ControlTask {
    async fn run(
        mut self,
        mut ctrl_rx: mpsc::Receiver<Vec<u8>>,
        mut rekey_rx: mpsc::Receiver<RekeyRequest>,
    ) -> Result<(), Error> {
        let cancel = self.cancel.clone();
        let mut tick = interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                Some(request) = rekey_rx.recv() => self.handle_request(request).await?,
                Some(payload) = ctrl_rx.recv() => self.handle_payload(&payload).await?,
                _ = tick.tick() => self.handle_tick()?,
            }
        }
    }

    async fn send_control(&self, msg: &ControlMsg) -> Result<(), Error> {
        let body = msg.encode()?;
        let wire = self.session.encrypt(PKT_CONTROL, &body)?;
        self.encrypted.send_to(&wire, self.peer).await?;
        Ok(())
    }

    async fn handle_request(&mut self, request: RekeyRequest) -> Result<(), Error> {
        if self.pending.is_some() {
            self.counters.record_rekey_fail();
            respond(
                request.done,
                Err(RekeyError::PrepareFailed("rekey already in progress".into()).into()),
            );
            return Ok(());
        }
        let prior = self.session.suite().suite_id.to_string();
        self.begin_prepare(request.target, prior, request.done, false).await
    }

    async fn begin_prepare(
        &mut self,
        target: String,
        prior: String,
        done: Option<oneshot::Sender<Result<(), Error>>>,
        is_rollback: bool,
    ) -> Result<(), Error> {
        let msg = match self.engine.start_prepare(&target, now_ts()) {
            Ok(msg) => msg,
            Err(e) => {
                self.counters.record_rekey_fail();
                if is_rollback {
                    return Err(RekeyError::SwapFailed.into());
                }
                respond(done, Err(e));
                return Ok(());
            }
        };
        if let Err(e) = self.send_control(&msg).await {
            self.engine.abort_prepare();
            self.counters.record_rekey_fail();
            if is_rollback {
                return Err(RekeyError::SwapFailed.into());
            }
            respond(done, Err(e));
            return Ok(());
        }
        debug!(suite = %target, is_rollback, "rekey prepare sent");
        self.pending = Some(PendingRekey { target, prior, done, is_rollback });
        Ok(())
    }

    async fn handle_payload(&mut self, payload: &[u8]) -> Result<(), Error> {
        let msg = match ControlMsg::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "undecodable control message");
                return Ok(());
            }
        };
        let keys = self.keys.clone();
        let action = self.engine.on_message(&msg, move |s| keys.supports(s.sig_name), now_ts());
        match action {
            ControlAction::None => Ok(()),
            ControlAction::Reply(reply) => {
                if let Err(e) = self.send_control(&reply).await {
                    warn!(error = %e, "control reply failed");
                }
                Ok(())
            }
            ControlAction::Commit { reply, target_suite } => {
                if let Err(e) = self.send_control(&reply).await {
                    warn!(error = %e, "commit reply failed");
                    self.engine.reset_to_running();
                    return Ok(());
                }
                self.swap_as_responder(&target_suite).await
            }
            ControlAction::Swap { target_suite } => self.swap_as_initiator(&target_suite).await,
            ControlAction::Failed { reason } => {
                self.counters.record_rekey_fail();
                let pending = self.pending.take();
                match pending {
                    Some(p) if p.is_rollback => {
                        error!(reason = %reason, "rollback rejected, terminating tunnel");
                        Err(RekeyError::SwapFailed.into())
                    }
                    Some(p) => {
                        warn!(reason = %reason, "rekey prepare rejected");
                        respond(p.done, Err(RekeyError::PrepareFailed(reason).into()));
                        Ok(())
                    }
                    None => Ok(()),
                }
            }
            ControlAction::Completed { status } => {
                info!(status = %status, "peer rekey status");
                Ok(())
            }
        }
    }

    fn handle_tick(&mut self) -> Result<(), Error> {
        if !self.engine.prepare_expired(Instant::now()) {
            return Ok(());
        }
        self.engine.abort_prepare();
        self.counters.record_rekey_fail();
        match self.pending.take() {
            Some(p) if p.is_rollback => {
                error!("rollback commit timed out, terminating tunnel");
                Err(RekeyError::SwapFailed.into())
            }
            Some(p) => {
                warn!(suite = %p.target, "rekey commit timed out");
                respond(p.done, Err(RekeyError::CommitTimeout.into()));
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Run the swap-phase handshake and replace the context atomically.
    async fn run_swap(&mut self, target: &str) -> Result<(), Error> {
        let suite = suites::get(target)?;
        let next_epoch = self.session.epoch().wrapping_add(1);
        let keys = self.keys.clone();
        let psk = self.psk.clone();
        let replay_window = self.replay_window;
        let stage_timeout = self.stage_timeout;
        let transport = &mut self.transport;
        let ctx = timeout(SWAP_TIMEOUT, async move {
            match transport {
                SwapTransport::Listener(listener) => {
                    let (mut stream, peer) = listener.accept().await?;
                    debug!(peer = %peer, "rekey handshake connection");
                    handshake::server_handshake(
                        &mut stream,
                        suite,
                        &keys,
                        &psk,
                        next_epoch,
                        replay_window,
                        stage_timeout,
                    )
                    .await
                }
                SwapTransport::Connect(addr) => {
                    let mut stream = TcpStream::connect(*addr).await?;
                    handshake::client_handshake(
                        &mut stream,
                        suite,
                        &keys,
                        &psk,
                        next_epoch,
                        replay_window,
                        stage_timeout,
                    )
                    .await
                }
            }
        })
        .await
        .map_err(|_| Error::from(RekeyError::SwapFailed))??;
        self.session.swap(ctx);
        Ok(())
    }

    async fn swap_as_initiator(&mut self, target: &str) -> Result<(), Error> {
        match self.run_swap(target).await {
            Ok(()) => {
                self.engine.swap_succeeded();
                self.counters.record_rekey_ok(target);
                let note = control::rekey_complete(target, "ok", now_ts());
                if let Err(e) = self.send_control(&note).await {
                    warn!(error = %e, "rekey complete notification failed");
                }
                let pending = self.pending.take();
                if let Some(p) = pending {
                    respond(p.done, Ok(()));
                }
                info!(suite = target, epoch = self.session.epoch(), "rekey complete");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, suite = target, "swap failed");
                self.engine.swap_failed();
                self.counters.record_rekey_fail();
                match self.pending.take() {
                    Some(p) if p.is_rollback => {
                        error!("rollback swap failed, terminating tunnel");
                        Err(RekeyError::SwapFailed.into())
                    }
                    Some(p) => {
                        respond(p.done, Err(RekeyError::SwapFailed.into()));
                        // One automatic rollback to the suite that was
                        // active before the attempt.
                        let prior = p.prior.clone();
                        info!(suite = %prior, "attempting rollback");
                        self.begin_prepare(prior.clone(), prior, None, true).await
                    }
                    None => Ok(()),
                }
            }
        }
    }

    async fn swap_as_responder(&mut self, target: &str) -> Result<(), Error> {
        match self.run_swap(target).await {
            Ok(()) => {
                self.engine.swap_succeeded();
                self.counters.record_rekey_ok(target);
                info!(suite = target, epoch = self.session.epoch(), "rekey complete");
                Ok(())
            }
            Err(e) => {
                // Keep the old context: the initiator drives recovery.
                warn!(error = %e, suite = target, "responder swap failed, keeping old context");
                self.engine.swap_failed();
                self.counters.record_rekey_fail();
                let note = control::rekey_complete(target, "failed", now_ts());
                if let Err(e) = self.send_control(&note).await {
                    warn!(error = %e, "rekey failure notification failed");
                }
                self.engine.reset_to_running();
                Ok(())
            }
        }
    }
}
