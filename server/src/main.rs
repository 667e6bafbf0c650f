use std::{env, net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};
use goconnect_control::{repo::sql::SqlRepository, AppState, ControlPlaneConfig};
use std::sync::Arc;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[clap(name = "goconnect-controld", author, version, about)]
struct Opts {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, default_value = "/etc/goconnect-control/config.toml")]
    config: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the control-plane HTTP + WebSocket service.
    Serve,

    /// Generate shell completion scripts.
    Completions {
        #[clap(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", "warn,goconnect_control=info");
    }
    pretty_env_logger::init();

    let opts = Opts::parse();
    match opts.command {
        Command::Serve => serve(&opts.config).await?,
        Command::Completions { shell } => {
            use clap::CommandFactory;
            let mut app = Opts::command();
            let name = app.get_name().to_string();
            clap_complete::generate(shell, &mut app, name, &mut std::io::stdout());
        },
    }
    Ok(())
}

async fn serve(config_path: &std::path::Path) -> anyhow::Result<()> {
    let config = ControlPlaneConfig::from_file(config_path)?;
    log::info!("goconnect-controld {} starting", VERSION);

    let repo = Arc::new(SqlRepository::open(&config.database_path)?);
    let state = AppState::new(repo, config.anchor_interval, config.jwt_secret.clone());

    spawn_idempotency_sweeper(state.clone(), config.idempotency_retention_hours);

    let app = goconnect_control::api::router(state);
    let addr: SocketAddr = config.listen_addr;
    log::info!("listening on {addr}");
    axum::Server::bind(&addr).serve(app.into_make_service()).await?;
    Ok(())
}

/// Sweeps expired idempotency records on a fixed interval, mirroring the
/// teacher's invite-expiry sweeper in `server/src/main.rs`.
fn spawn_idempotency_sweeper(state: AppState, retention_hours: i64) {
    tokio::task::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            interval.tick().await;
            let ct = tokio_util::sync::CancellationToken::new();
            let older_than = chrono::Utc::now() - chrono::Duration::hours(retention_hours);
            match state
                .repo
                .sweep_idempotency_records(ct, older_than)
                .await
            {
                Ok(deleted) if deleted > 0 => {
                    log::info!("swept {deleted} expired idempotency records");
                },
                Err(e) => log::error!("idempotency sweep failed: {e}"),
                _ => {},
            }
        }
    });
}
