//! `goconnectd` — the daemon entry point. CLI parsing mirrors
//! `goconnect-controld`'s `Opts`/`Command` shape; `run` wires together
//! identity, the reconciliation engine, and the local IPC server under one
//! `CancellationToken`, shutting down on SIGINT/SIGTERM with the IPC token
//! deleted on exit per spec §4.11.

use std::{env, net::IpAddr, path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use goconnect_shared::domain::{DeviceId, NetworkId};
use tokio_util::sync::CancellationToken;
use wireguard_control::{Backend, InterfaceName};

mod config;
mod control_client;
mod engine;
mod identity;
mod ipc;
mod overlay;
mod p2p;
mod util;

use config::DaemonConfig;
use control_client::{ControlClient, RegisterDeviceReq};
use engine::{Engine, SystemProbe};
use identity::{FileSecretStore, Identity, SecretStore};
use ipc::{auth::IpcToken, DaemonState, IpcEventBus};
use overlay::Overlay;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[clap(name = "goconnectd", author, version, about)]
struct Opts {
    #[clap(subcommand)]
    command: Command,

    /// Defaults to `~/.goconnect/config.yaml`.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Verbose output, use -vv for even higher verbositude
    #[clap(short, long, parse(from_occurrences))]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon in the foreground.
    Run,

    /// Generate shell completion scripts.
    Completions {
        #[clap(value_enum)]
        shell: clap_complete::Shell,
    },
}

fn main() {
    let opts = Opts::parse();
    util::init_logger(opts.verbose);

    let config_path = opts.config.clone().unwrap_or_else(DaemonConfig::default_path);

    let result = match &opts.command {
        Command::Run => tokio::runtime::Runtime::new()
            .expect("building the tokio runtime")
            .block_on(run(&config_path)),
        Command::Completions { shell } => {
            use clap::CommandFactory;
            let mut app = Opts::command();
            let name = app.get_name().to_string();
            clap_complete::generate(*shell, &mut app, name, &mut std::io::stdout());
            Ok(())
        },
    };

    if let Err(e) = result {
        if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
            let config_dir = config_path.parent().unwrap_or_else(|| std::path::Path::new("."));
            util::permissions_helptext(config_dir, io_err);
        }
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(config_path: &std::path::Path) -> anyhow::Result<()> {
    let config = DaemonConfig::from_file(config_path)?;
    log::info!("goconnectd {VERSION} starting, interface {}", config.interface);

    let identity_path = config.identity_path();
    let identity = Identity::load_or_generate(&identity_path)?;
    let device_id = DeviceId(identity.device_id.clone());
    log::info!("device identity: {device_id}");

    let secrets = FileSecretStore::new(
        identity_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".")),
    );
    let bearer_token = bootstrap_bearer_token(&secrets, &config, &identity)?;

    let control = Arc::new(ControlClient::new(
        config.control_plane_url.clone(),
        bearer_token,
    ));

    // Network membership is assumed to already exist by the time the
    // daemon runs; a separate onboarding step (out of scope here) drives
    // create/join through the same `NetworkService` IPC surface.
    let network_id = NetworkId(
        env::var("GOCONNECT_NETWORK_ID")
            .map_err(|_| anyhow::anyhow!("GOCONNECT_NETWORK_ID must be set"))?,
    );

    let interface: InterfaceName = config.interface.parse()?;
    let probe = SystemProbe {
        interface,
        backend: Backend::default(),
        no_write_hosts: config.no_write_hosts,
    };

    let events = Arc::new(IpcEventBus::new());
    let overlay = Overlay::new(device_id.0.clone(), events.clone());

    let signaling_url = to_ws_url(&config.control_plane_url, &network_id, &device_id);
    let (engine, p2p, mut p2p_events) = Engine::new(
        control.clone(),
        device_id.clone(),
        network_id,
        probe,
        overlay.clone(),
        signaling_url,
        std::time::Duration::from_secs(config.health_check_interval_secs),
    );
    let engine = Arc::new(engine);

    tokio::spawn({
        let events = events.clone();
        async move {
            while let Some(event) = p2p_events.recv().await {
                events.publish(to_ipc_event(event));
            }
        }
    });

    let state = Arc::new(DaemonState {
        device_id: device_id.0.clone(),
        started_at: chrono::Utc::now(),
        control,
        engine: engine.clone(),
        p2p,
        events,
        active_interfaces: vec![config.interface.clone()],
        overlay: overlay.clone(),
    });

    let ct = CancellationToken::new();

    if let Some(addr) = wireguard_interface_addr() {
        engine.start_overlay_listener(addr).await?;
    } else {
        log::warn!(
            "no address found on {}; chat/transfer listener not started",
            config.interface
        );
    }

    let token = IpcToken::generate();
    let token_path = IpcToken::default_path();
    token.write(&token_path)?;

    let engine_task = tokio::spawn({
        let engine = engine.clone();
        let ct = ct.clone();
        async move { engine.run(ct).await }
    });

    let ipc_task = tokio::spawn(ipc::serve_unix(
        config.ipc_socket_path.clone(),
        state,
        token,
        ct.clone(),
    ));

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, draining");
    ct.cancel();

    let _ = engine_task.await;
    if let Ok(Err(e)) = ipc_task.await {
        log::error!("IPC server exited with error: {e}");
    }
    let _ = IpcToken::delete(&token_path);

    log::info!("goconnectd stopped");
    Ok(())
}

/// Resolves the daemon's control-plane bearer token. Interactive
/// login/2FA is out of scope (spec §1) — the token is provisioned by an
/// external onboarding step and cached in the secret store; the daemon
/// only re-reads it, registering the device on first run so the control
/// plane at least has a record of the public key.
fn bootstrap_bearer_token(
    secrets: &FileSecretStore,
    config: &DaemonConfig,
    identity: &Identity,
) -> anyhow::Result<String> {
    if let Some(token) = secrets.get("bearer_token")? {
        return Ok(token);
    }
    if let Ok(token) = env::var("GOCONNECT_BEARER_TOKEN") {
        secrets.set("bearer_token", &token)?;
        return Ok(token);
    }

    let control = ControlClient::new(config.control_plane_url.clone(), "");
    let _ = control.register_device(&RegisterDeviceReq {
        name: config.device_name.clone(),
        platform: goconnect_shared::domain::Platform::Linux,
        public_key: identity.public_key.clone(),
        hostname: hostname(),
        os_version: None,
        daemon_version: Some(VERSION.to_string()),
    });
    anyhow::bail!("no cached bearer token; set GOCONNECT_BEARER_TOKEN once to complete onboarding")
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn to_ws_url(control_plane_url: &str, network_id: &NetworkId, device_id: &DeviceId) -> String {
    let ws_base = control_plane_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!(
        "{ws_base}/v1/ws?network_id={}&device_id={}",
        network_id.0, device_id.0
    )
}

/// Picks the address the chat listener binds to. A real build reads this
/// off the WireGuard interface once `SystemProbe::apply` has run; absent
/// that (the interface may not exist yet on first boot), it falls back to
/// the first local address `goconnect_shared::get_local_addrs` reports.
fn wireguard_interface_addr() -> Option<IpAddr> {
    goconnect_shared::get_local_addrs().ok()?.next()
}

fn to_ipc_event(event: p2p::P2pEvent) -> goconnect_proto::goconnect::Event {
    let (kind, payload) = match event {
        p2p::P2pEvent::Connected { peer_id, addr } => (
            "p2p_connected",
            serde_json::json!({"peer_id": peer_id.0, "addr": addr.to_string()}),
        ),
        p2p::P2pEvent::Failed { peer_id } => {
            ("p2p_failed", serde_json::json!({"peer_id": peer_id.0}))
        },
    };
    goconnect_proto::goconnect::Event {
        kind: kind.to_string(),
        at: Some(goconnect_proto::goconnect::Timestamp {
            unix_seconds: chrono::Utc::now().timestamp(),
        }),
        payload_json: payload.to_string(),
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {},
        _ = sigint.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
