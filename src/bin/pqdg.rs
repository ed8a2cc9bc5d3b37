//! pq-drone-gcs proxy CLI.
//!
//! `pqdg gcs` and `pqdg drone` run the two tunnel endpoints; `pqdg keygen`
//! provisions the long-term GCS signing keypair; `pqdg suites` prints the
//! registry.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pq_drone_gcs::config::{Config, Role};
use pq_drone_gcs::errors::Error;
use pq_drone_gcs::keys::SigKeyStore;
use pq_drone_gcs::proxy::Proxy;
use pq_drone_gcs::suites;

#[derive(Parser)]
#[command(name = "pqdg")]
#[command(about = "Post-quantum authenticated UDP tunnel (GCS <-> drone)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ground control station proxy (handshake server).
    Gcs {
        /// Suite identifier, e.g. cs-mlkem768-aesgcm-mldsa65.
        #[arg(long)]
        suite: String,

        /// Directory holding the GCS signing keys (<sig>.key files).
        #[arg(long)]
        keys: PathBuf,

        /// One-shot scheduler hook: rekey to this suite...
        #[arg(long)]
        rekey_to: Option<String>,

        /// ...this many seconds after startup.
        #[arg(long, default_value_t = 30)]
        rekey_after: u64,
    },

    /// Run the drone proxy (handshake client).
    Drone {
        /// Suite identifier, e.g. cs-mlkem768-aesgcm-mldsa65.
        #[arg(long)]
        suite: String,

        /// Directory holding the GCS verifying keys (<sig>.pub files).
        #[arg(long)]
        keys: PathBuf,
    },

    /// Generate the long-term GCS signing keypair for a suite.
    Keygen {
        /// Suite identifier whose signature scheme to provision.
        #[arg(long)]
        suite: String,

        /// Output directory for <sig>.key / <sig>.pub.
        #[arg(long)]
        out: PathBuf,
    },

    /// List the registered cryptographic suites.
    Suites,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Error::Config(msg)) => {
            error!(error = %msg, "configuration invalid");
            ExitCode::from(2)
        }
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Commands::Gcs { suite, keys, rekey_to, rekey_after } => {
            run_proxy(Role::Gcs, &suite, &keys, rekey_to.map(|t| (t, rekey_after))).await
        }
        Commands::Drone { suite, keys } => run_proxy(Role::Drone, &suite, &keys, None).await,
        Commands::Keygen { suite, out } => keygen(&suite, &out),
        Commands::Suites => {
            print_suites();
            Ok(())
        }
    }
}

async fn run_proxy(
    role: Role,
    suite_id: &str,
    key_dir: &PathBuf,
    scheduled_rekey: Option<(String, u64)>,
) -> Result<(), Error> {
    let config = Config::from_env()?;
    let mut schemes: Vec<&str> = suites::list()
        .into_iter()
        .filter_map(|id| suites::get(id).ok().map(|s| s.sig_name))
        .collect();
    schemes.sort_unstable();
    schemes.dedup();
    let keys = SigKeyStore::load_dir(key_dir, &schemes)?;

    let handle = Proxy::new(role, suite_id, config, keys)?.start().await?;
    info!(
        encrypted = %handle.local.encrypted,
        plaintext = %handle.local.plaintext,
        "tunnel up"
    );

    if let Some((target, after)) = scheduled_rekey {
        tokio::select! {
            outcome = wait_and_rekey(&handle, &target, after) => {
                if let Err(e) = outcome {
                    error!(error = %e, "scheduled rekey failed");
                }
            }
            _ = tokio::signal::ctrl_c() => return finish(handle).await,
        }
    }

    tokio::signal::ctrl_c().await?;
    finish(handle).await
}

async fn wait_and_rekey(
    handle: &pq_drone_gcs::proxy::ProxyHandle,
    target: &str,
    after_secs: u64,
) -> Result<(), Error> {
    tokio::time::sleep(std::time::Duration::from_secs(after_secs)).await;
    info!(suite = %target, "scheduled rekey starting");
    handle.request_rekey(target).await
}

async fn finish(handle: pq_drone_gcs::proxy::ProxyHandle) -> Result<(), Error> {
    let counters = handle.shutdown().await?;
    match serde_json::to_string_pretty(&counters) {
        Ok(json) => println!("{json}"),
        Err(_) => println!("{counters:?}"),
    }
    Ok(())
}

fn keygen(suite_id: &str, out: &PathBuf) -> Result<(), Error> {
    let suite = suites::get(suite_id)?;
    let (key_name, pub_name) = SigKeyStore::generate_into(out, suite.sig_name)?;
    println!("wrote {} and {} under {}", key_name, pub_name, out.display());
    println!("deploy {pub_name} to the drone; keep {key_name} on the GCS only");
    Ok(())
}

fn print_suites() {
    println!(
        "{:<34} {:<12} {:<18} {:>5}  wire ids",
        "suite", "kem", "signature", "nist"
    );
    for id in suites::list() {
        if let Ok(s) = suites::get(id) {
            println!(
                "{:<34} {:<12} {:<18} {:>5}  {:02x}:{:02x}:{:02x}:{:02x}",
                s.suite_id,
                s.kem_name,
                s.sig_name,
                s.nist_level,
                s.kem_id,
                s.kem_param_id,
                s.sig_id,
                s.sig_param_id
            );
        }
    }
}
