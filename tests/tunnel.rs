//! End-to-end proxy scenarios on loopback: plaintext in one side, same
//! plaintext out the other, counters accounted, and a live two-phase rekey
//! that advances the epoch without tearing the tunnel down.

use std::net::IpAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

use pq_drone_gcs::config::{Config, Psk, Role};
use pq_drone_gcs::errors::{Error, RekeyError};
use pq_drone_gcs::keys::SigKeyStore;
use pq_drone_gcs::proxy::{Proxy, ProxyHandle};
use pq_drone_gcs::sig::SigAlgorithm;

const START_SUITE: &str = "cs-mlkem512-aesgcm-mldsa44";
const REKEY_SUITE: &str = "cs-mlkem1024-aesgcm-mldsa87";

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn test_config() -> Config {
    Config {
        tcp_handshake_port: free_tcp_port(),
        udp_gcs_rx: free_udp_port(),
        udp_drone_rx: free_udp_port(),
        gcs_plaintext_tx: free_udp_port(),
        gcs_plaintext_rx: free_udp_port(),
        drone_plaintext_tx: free_udp_port(),
        drone_plaintext_rx: free_udp_port(),
        gcs_host: IpAddr::from([127, 0, 0, 1]),
        drone_host: IpAddr::from([127, 0, 0, 1]),
        replay_window: 1024,
        psk: Psk([0x33; 32]),
        handshake_timeout: Duration::from_secs(10),
    }
}

/// Signing material on the GCS, verifying material on the drone, for both
/// the startup suite and the rekey target.
fn keystores(sig_names: &[&str]) -> (SigKeyStore, SigKeyStore) {
    let mut gcs = SigKeyStore::new();
    let mut drone = SigKeyStore::new();
    for name in sig_names {
        let alg = SigAlgorithm::from_name(name).unwrap();
        let (pk, sk) = alg.generate();
        gcs.insert_signing(name, sk);
        drone.insert_verifying(name, pk);
    }
    (gcs, drone)
}

async fn start_pair(
    config: &Config,
    gcs_keys: SigKeyStore,
    drone_keys: SigKeyStore,
) -> (ProxyHandle, ProxyHandle) {
    let gcs_proxy = Proxy::new(Role::Gcs, START_SUITE, config.clone(), gcs_keys).unwrap();
    let gcs_task = tokio::spawn(gcs_proxy.start());
    // Give the listener a moment; the drone retries with backoff anyway.
    sleep(Duration::from_millis(50)).await;
    let drone = Proxy::new(Role::Drone, START_SUITE, config.clone(), drone_keys)
        .unwrap()
        .start()
        .await
        .unwrap();
    let gcs = gcs_task.await.unwrap().unwrap();
    (gcs, drone)
}

async fn send_and_expect(
    config: &Config,
    payload: &[u8],
) -> Result<Vec<u8>, tokio::time::error::Elapsed> {
    // The application receives where the GCS proxy delivers.
    let sink = UdpSocket::bind(("127.0.0.1", config.gcs_plaintext_tx)).await.unwrap();
    let app = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    app.send_to(payload, ("127.0.0.1", config.drone_plaintext_rx)).await.unwrap();

    let mut buf = vec![0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(5), sink.recv_from(&mut buf)).await?.unwrap();
    Ok(buf[..len].to_vec())
}

#[tokio::test(flavor = "multi_thread")]
async fn ping_roundtrip_with_counters() {
    let config = test_config();
    let (gcs_keys, drone_keys) = keystores(&["ML-DSA-44"]);
    let (gcs, drone) = start_pair(&config, gcs_keys, drone_keys).await;

    let delivered = send_and_expect(&config, b"PING").await.unwrap();
    assert_eq!(delivered, b"PING");

    // Let the counter increments land before snapshotting.
    sleep(Duration::from_millis(100)).await;

    let d = drone.counters_snapshot();
    assert_eq!(d.ptx_in, 1);
    assert_eq!(d.enc_out, 1);
    assert_eq!(d.drops, 0);

    let g = gcs.counters_snapshot();
    assert_eq!(g.enc_in, 1);
    assert_eq!(g.ptx_out, 1);
    assert_eq!(g.drops, 0);

    assert!(gcs.shutdown().await.is_ok());
    assert!(drone.shutdown().await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn rekey_advances_epoch_and_keeps_forwarding() {
    let config = test_config();
    let (gcs_keys, drone_keys) = keystores(&["ML-DSA-44", "ML-DSA-87"]);
    let (gcs, drone) = start_pair(&config, gcs_keys, drone_keys).await;

    assert_eq!(send_and_expect(&config, b"before").await.unwrap(), b"before");

    gcs.request_rekey(REKEY_SUITE).await.unwrap();

    let snap = gcs.session_snapshot();
    assert_eq!(snap.suite_id, REKEY_SUITE);
    assert_eq!(snap.epoch, 1);
    // Sequence restarted; at most the completion notification was sent.
    assert!(snap.send_seq <= 1, "send_seq={}", snap.send_seq);

    // The drone swapped too, and both sides recorded the outcome.
    sleep(Duration::from_millis(200)).await;
    let snap = drone.session_snapshot();
    assert_eq!(snap.suite_id, REKEY_SUITE);
    assert_eq!(snap.epoch, 1);

    let g = gcs.counters_snapshot();
    assert_eq!(g.rekeys_ok, 1);
    assert_eq!(g.rekeys_fail, 0);
    assert_eq!(g.last_rekey_suite.as_deref(), Some(REKEY_SUITE));
    let d = drone.counters_snapshot();
    assert_eq!(d.rekeys_ok, 1);
    assert_eq!(d.last_rekey_suite.as_deref(), Some(REKEY_SUITE));

    // Traffic still flows under the new epoch.
    assert_eq!(send_and_expect(&config, b"after").await.unwrap(), b"after");

    assert!(gcs.shutdown().await.is_ok());
    assert!(drone.shutdown().await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn drone_may_not_initiate_rekey() {
    let config = test_config();
    let (gcs_keys, drone_keys) = keystores(&["ML-DSA-44"]);
    let (gcs, drone) = start_pair(&config, gcs_keys, drone_keys).await;

    let outcome = drone.request_rekey(START_SUITE).await;
    assert!(
        matches!(outcome, Err(Error::Rekey(RekeyError::Unauthorized))),
        "got {outcome:?}"
    );
    assert_eq!(drone.counters_snapshot().rekeys_fail, 1);
    assert_eq!(drone.session_snapshot().epoch, 0);

    assert!(gcs.shutdown().await.is_ok());
    assert!(drone.shutdown().await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn rekey_to_unknown_suite_fails_cleanly() {
    let config = test_config();
    let (gcs_keys, drone_keys) = keystores(&["ML-DSA-44"]);
    let (gcs, drone) = start_pair(&config, gcs_keys, drone_keys).await;

    let outcome = gcs.request_rekey("cs-unknown").await;
    assert!(matches!(outcome, Err(Error::UnknownSuite(_))), "got {outcome:?}");
    assert_eq!(gcs.counters_snapshot().rekeys_fail, 1);

    // The tunnel is unaffected.
    assert_eq!(send_and_expect(&config, b"still up").await.unwrap(), b"still up");

    assert!(gcs.shutdown().await.is_ok());
    assert!(drone.shutdown().await.is_ok());
}
