//! Post-quantum handshake engine.
//!
//! ## Handshake flow (2-message, length-prefixed over TCP):
//! ```text
//! Drone (client)                         GCS (server)
//!   |                                      | 1. session_id, challenge <- RNG
//!   |                                      | 2. ephemeral KEM keypair
//!   |                                      | 3. sign transcript
//!   |      ServerHello(names, ids,        |
//!   |        kem_pub, challenge, sig)     |
//!   |<-------------------------------------|
//!   | 1. enforce expected suite names      |
//!   | 2. verify transcript signature       |
//!   | 3. KEM encaps -> CT, SS              |
//!   | 4. tag = HMAC(PSK, ServerHello)      |
//!   |      ClientResponse(CT, tag)         |
//!   |------------------------------------->|
//!   |                                      | verify tag, KEM decaps -> SS
//!   |                                      |
//!   |    both: HKDF-SHA256(SS) -> k_d2g || k_g2d
//! ```
//!
//! ## Security properties
//! - Server authentication: signature over the full transcript
//! - Client authentication: PSK HMAC over the exact ServerHello bytes
//! - Downgrade defense: client rejects any advertised algorithm name that
//!   differs from its configured suite, before any KEM work
//! - Per-stage timeouts; every failure is fatal for the attempt and no
//!   partial state is retained

use std::future::Future;
use std::time::Duration;

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use zeroize::Zeroizing;

use crate::config::Psk;
use crate::errors::Error;
use crate::framing::WIRE_VERSION;
use crate::kem::KemAlgorithm;
use crate::keys::SigKeyStore;
use crate::session::{DirectionalKeys, SessionContext};
use crate::sig::SigAlgorithm;
use crate::suites::{self, Suite};

type HmacSha256 = Hmac<Sha256>;

/// Transcript domain separator between the version byte and session id.
const TRANSCRIPT_LABEL: &[u8] = b"|pq-drone-gcs:v1|";

/// HKDF salt, fixed for wire version 1.
const HKDF_SALT: &[u8] = b"pq-drone-gcs|hkdf|v1";

/// Upper bound on one length-prefixed handshake frame.
const MAX_FRAME: usize = 256 * 1024;

/// PSK HMAC tag length.
const TAG_LEN: usize = 32;

/* ============================================================================
 * Wire helpers
 * ========================================================================== */

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, Error> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len == 0 || len > MAX_FRAME {
        return Err(Error::HandshakeFormat(format!("frame length {len} out of range")));
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, payload: &[u8]) -> Result<(), Error> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::HandshakeFormat("frame too large".into()))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn staged<T>(
    stage_timeout: Duration,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    match timeout(stage_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::HandshakeTimeout),
    }
}

struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::HandshakeFormat("truncated handshake frame".into()))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn finish(&self) -> Result<(), Error> {
        if self.pos != self.buf.len() {
            return Err(Error::HandshakeFormat("trailing bytes in handshake frame".into()));
        }
        Ok(())
    }
}

/* ============================================================================
 * ServerHello
 * ========================================================================== */

struct ServerHello {
    kem_name: String,
    sig_name: String,
    session_id: [u8; 8],
    challenge: [u8; 8],
    kem_pub: Vec<u8>,
    signature: Vec<u8>,
}

fn encode_server_hello(
    suite: &Suite,
    session_id: &[u8; 8],
    challenge: &[u8; 8],
    kem_pub: &[u8],
    signature: &[u8],
) -> Result<Vec<u8>, Error> {
    let kem_pub_len = u16::try_from(kem_pub.len())
        .map_err(|_| Error::HandshakeFormat("KEM public key too large".into()))?;
    let sig_len = u16::try_from(signature.len())
        .map_err(|_| Error::HandshakeFormat("signature too large".into()))?;

    let mut out = Vec::with_capacity(32 + kem_pub.len() + signature.len());
    out.push(WIRE_VERSION);
    out.push(suite.kem_name.len() as u8);
    out.extend_from_slice(suite.kem_name.as_bytes());
    out.push(suite.sig_name.len() as u8);
    out.extend_from_slice(suite.sig_name.as_bytes());
    out.extend_from_slice(session_id);
    out.extend_from_slice(challenge);
    out.extend_from_slice(&kem_pub_len.to_be_bytes());
    out.extend_from_slice(kem_pub);
    out.extend_from_slice(&sig_len.to_be_bytes());
    out.extend_from_slice(signature);
    Ok(out)
}

fn parse_server_hello(payload: &[u8]) -> Result<ServerHello, Error> {
    let mut r = FrameReader::new(payload);
    let version = r.u8()?;
    if version != WIRE_VERSION {
        return Err(Error::HandshakeFormat(format!("unsupported wire version {version}")));
    }
    let kem_name_len = r.u8()? as usize;
    let kem_name = String::from_utf8(r.take(kem_name_len)?.to_vec())
        .map_err(|_| Error::HandshakeFormat("KEM name is not UTF-8".into()))?;
    let sig_name_len = r.u8()? as usize;
    let sig_name = String::from_utf8(r.take(sig_name_len)?.to_vec())
        .map_err(|_| Error::HandshakeFormat("signature name is not UTF-8".into()))?;
    let mut session_id = [0u8; 8];
    session_id.copy_from_slice(r.take(8)?);
    let mut challenge = [0u8; 8];
    challenge.copy_from_slice(r.take(8)?);
    let kem_pub_len = r.u16()? as usize;
    let kem_pub = r.take(kem_pub_len)?.to_vec();
    let sig_len = r.u16()? as usize;
    let signature = r.take(sig_len)?.to_vec();
    r.finish()?;
    Ok(ServerHello { kem_name, sig_name, session_id, challenge, kem_pub, signature })
}

/// The byte string both sides sign/verify. Reproduced bit-identically:
/// `version || "|pq-drone-gcs:v1|" || session_id || "|" || kem_name ||
/// "|" || sig_name || "|" || kem_pub || "|" || challenge`.
fn transcript(
    suite: &Suite,
    session_id: &[u8; 8],
    challenge: &[u8; 8],
    kem_pub: &[u8],
) -> Vec<u8> {
    let mut t = Vec::with_capacity(64 + kem_pub.len());
    t.push(WIRE_VERSION);
    t.extend_from_slice(TRANSCRIPT_LABEL);
    t.extend_from_slice(session_id);
    t.push(b'|');
    t.extend_from_slice(suite.kem_name.as_bytes());
    t.push(b'|');
    t.extend_from_slice(suite.sig_name.as_bytes());
    t.push(b'|');
    t.extend_from_slice(kem_pub);
    t.push(b'|');
    t.extend_from_slice(challenge);
    t
}

/* ============================================================================
 * Key schedule
 * ========================================================================== */

fn derive_directional(
    shared_secret: &[u8],
    suite: &Suite,
    session_id: &[u8; 8],
) -> Result<(Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>), Error> {
    let info = suites::hkdf_info(suite, session_id);
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret);
    let mut okm = Zeroizing::new([0u8; 64]);
    hk.expand(&info, &mut *okm).map_err(|_| Error::Aead)?;
    let mut k_d2g = Zeroizing::new([0u8; 32]);
    let mut k_g2d = Zeroizing::new([0u8; 32]);
    k_d2g.copy_from_slice(&okm[..32]);
    k_g2d.copy_from_slice(&okm[32..]);
    Ok((k_d2g, k_g2d))
}

fn psk_tag(psk: &Psk, server_hello: &[u8]) -> Result<[u8; TAG_LEN], Error> {
    let mut mac =
        HmacSha256::new_from_slice(psk.as_bytes()).map_err(|_| Error::Aead)?;
    mac.update(server_hello);
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&mac.finalize().into_bytes());
    Ok(tag)
}

/* ============================================================================
 * Roles
 * ========================================================================== */

/// GCS side. Emits the signed ServerHello, authenticates the drone by PSK
/// tag, decapsulates and derives the directional keys.
///
/// `epoch` is 0 at startup; rekey passes the successor epoch.
pub async fn server_handshake<S>(
    stream: &mut S,
    suite: &'static Suite,
    keys: &SigKeyStore,
    psk: &Psk,
    epoch: u8,
    replay_window: usize,
    stage_timeout: Duration,
) -> Result<SessionContext, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let signing_key = keys
        .signing_for(suite.sig_name)
        .ok_or_else(|| Error::Config(format!("no signing key for {}", suite.sig_name)))?;

    let mut session_id = [0u8; 8];
    OsRng.fill_bytes(&mut session_id);
    let mut challenge = [0u8; 8];
    OsRng.fill_bytes(&mut challenge);

    let kem = KemAlgorithm::from_name(suite.kem_name)?;
    let (kem_pub, kem_secret) = kem.generate();

    let t = transcript(suite, &session_id, &challenge, &kem_pub);
    let signature = signing_key.sign(&t);
    let hello = encode_server_hello(suite, &session_id, &challenge, &kem_pub, &signature)?;
    staged(stage_timeout, write_frame(stream, &hello)).await?;

    let response = staged(stage_timeout, read_frame(stream)).await?;
    let mut r = FrameReader::new(&response);
    let ct_len = r.u16()? as usize;
    let kem_ct = r.take(ct_len)?.to_vec();
    let tag = r.take(TAG_LEN)?;
    r.finish()?;

    let mut mac =
        HmacSha256::new_from_slice(psk.as_bytes()).map_err(|_| Error::Aead)?;
    mac.update(&hello);
    mac.verify_slice(tag).map_err(|_| Error::HandshakeVerify)?;

    let shared_secret = kem_secret.decapsulate(&kem_ct)?;
    let (k_d2g, k_g2d) = derive_directional(&shared_secret, suite, &session_id)?;

    SessionContext::new(
        suite,
        session_id,
        epoch,
        DirectionalKeys { send: k_g2d, recv: k_d2g },
        replay_window,
    )
}

/// Drone side. Verifies the signed ServerHello against the pre-installed
/// GCS verifying key, encapsulates, proves PSK possession and derives the
/// directional keys.
pub async fn client_handshake<S>(
    stream: &mut S,
    suite: &'static Suite,
    keys: &SigKeyStore,
    psk: &Psk,
    epoch: u8,
    replay_window: usize,
    stage_timeout: Duration,
) -> Result<SessionContext, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let verifying_key = keys
        .verifying_for(suite.sig_name)
        .ok_or_else(|| Error::Config(format!("no verifying key for {}", suite.sig_name)))?;

    let hello = staged(stage_timeout, read_frame(stream)).await?;
    let parsed = parse_server_hello(&hello)?;

    // Downgrade defense: the advertised names must equal the configured
    // suite exactly. No auto-selection.
    if parsed.kem_name != suite.kem_name || parsed.sig_name != suite.sig_name {
        return Err(Error::HandshakeFormat(format!(
            "peer offered {}/{}, expected {}/{}",
            parsed.kem_name, parsed.sig_name, suite.kem_name, suite.sig_name
        )));
    }

    let t = transcript(suite, &parsed.session_id, &parsed.challenge, &parsed.kem_pub);
    let sig_alg = SigAlgorithm::from_name(suite.sig_name)?;
    sig_alg.verify(verifying_key, &t, &parsed.signature)?;

    let kem = KemAlgorithm::from_name(suite.kem_name)?;
    let (kem_ct, shared_secret) = kem.encapsulate(&parsed.kem_pub)?;

    let tag = psk_tag(psk, &hello)?;
    let ct_len = u16::try_from(kem_ct.len())
        .map_err(|_| Error::HandshakeFormat("KEM ciphertext too large".into()))?;
    let mut response = Vec::with_capacity(2 + kem_ct.len() + TAG_LEN);
    response.extend_from_slice(&ct_len.to_be_bytes());
    response.extend_from_slice(&kem_ct);
    response.extend_from_slice(&tag);
    staged(stage_timeout, write_frame(stream, &response)).await?;

    let (k_d2g, k_g2d) = derive_directional(&shared_secret, suite, &parsed.session_id)?;

    SessionContext::new(
        suite,
        parsed.session_id,
        epoch,
        DirectionalKeys { send: k_d2g, recv: k_g2d },
        replay_window,
    )
}
