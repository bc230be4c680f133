use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use valhalla_ledger::Ledger;
use valhalla_lightning::{Lightning, MockClient, StrikeClient};
use valhalla_server::monitor::GameMonitor;
use valhalla_server::users::{MockProvisioner, Provisioner, SystemProvisioner};
use valhalla_server::{api::Api, Arena, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "valhalla-server", about = "Lightning-funded roguelike arena")]
struct Args {
    /// Address to serve the HTTP/WS API on.
    #[arg(long, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    #[arg(long, default_value = "/var/lib/valhalla/ledger.sqlite")]
    database: PathBuf,

    /// Xlogfile appended to by the game engine.
    #[arg(long, default_value = "/var/games/nethack/xlogfile")]
    xlogfile: PathBuf,

    /// Entry fee in sats.
    #[arg(long, default_value_t = 1000)]
    ante_sats: u64,

    /// Initial pot balance; also the post-payout floor.
    #[arg(long, default_value_t = 10_000)]
    pot_seed_sats: u64,

    #[arg(long, default_value_t = 100)]
    max_active_sessions: u64,

    /// Xlogfile poll interval in seconds.
    #[arg(long, default_value_t = 2)]
    poll_interval_secs: u64,

    /// Terminal idle timeout in seconds.
    #[arg(long, default_value_t = 300)]
    idle_timeout_secs: u64,

    /// Death-text substring that marks a win.
    #[arg(long, default_value = "ascended")]
    win_keyword: String,

    /// Prefix for provisioned system users.
    #[arg(long, default_value = "nh_")]
    user_prefix: String,

    #[arg(long, default_value = "games")]
    user_group: String,

    /// Login shell installed for provisioned users.
    #[arg(long, default_value = "/usr/local/bin/valhalla-shell.sh")]
    user_shell: PathBuf,

    /// Command the terminal bridge runs under a pty; the session username
    /// is appended.
    #[arg(long, default_value = "su --login")]
    login_command: String,

    /// Hostname advertised in ssh commands and notifications.
    #[arg(long, default_value = "localhost")]
    hostname: String,

    /// Strike API key; falls back to STRIKE_API_KEY. Without one the mock
    /// provider is used.
    #[arg(long)]
    strike_api_key: Option<String>,

    /// Force the mock provider even when an API key is present.
    #[arg(long)]
    mock_lightning: bool,

    /// Shared secret for webhook signature verification; falls back to
    /// WEBHOOK_SECRET.
    #[arg(long)]
    webhook_secret: Option<String>,

    /// Optional per-IP request rate limit.
    #[arg(long)]
    rate_limit_per_second: Option<u64>,

    #[arg(long)]
    rate_limit_burst: Option<u32>,
}

fn env_string(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn build_config(args: &Args) -> Result<ServerConfig> {
    if args.ante_sats == 0 {
        bail!("ante_sats must be positive");
    }
    if args.poll_interval_secs == 0 {
        bail!("poll_interval_secs must be positive");
    }
    if args.idle_timeout_secs == 0 {
        bail!("idle_timeout_secs must be positive");
    }
    let login_command: Vec<String> = args
        .login_command
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if login_command.is_empty() {
        bail!("login_command must name a program");
    }

    Ok(ServerConfig {
        listen: args.listen,
        database_path: args.database.clone(),
        xlogfile_path: args.xlogfile.clone(),
        ante_sats: args.ante_sats,
        pot_seed_sats: args.pot_seed_sats,
        max_active_sessions: args.max_active_sessions,
        poll_interval: Duration::from_secs(args.poll_interval_secs),
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        win_keyword: args.win_keyword.clone(),
        user_prefix: args.user_prefix.clone(),
        user_group: args.user_group.clone(),
        user_shell: args.user_shell.clone(),
        login_command,
        hostname: args.hostname.clone(),
        webhook_secret: args
            .webhook_secret
            .clone()
            .or_else(|| env_string("WEBHOOK_SECRET")),
        http_rate_limit_per_second: args.rate_limit_per_second,
        http_rate_limit_burst: args.rate_limit_burst,
    })
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();
}

async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
    let _ = shutdown.send(true);
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = build_config(&args)?;

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("create database directory")?;
    }
    let ledger =
        Ledger::open(&config.database_path, config.pot_seed_sats).context("open ledger")?;

    let strike_api_key = args
        .strike_api_key
        .clone()
        .or_else(|| env_string("STRIKE_API_KEY"));
    let mock_mode = args.mock_lightning || strike_api_key.is_none();
    let (lightning, provisioner) = if mock_mode {
        info!("mock mode: fake payments and in-memory provisioning");
        (
            Lightning::Mock(MockClient::new()),
            Provisioner::Mock(MockProvisioner::new()),
        )
    } else {
        let api_key = strike_api_key.context("strike_api_key required outside mock mode")?;
        (
            Lightning::Strike(StrikeClient::new(api_key)),
            Provisioner::System(SystemProvisioner::new(
                config.user_prefix.clone(),
                config.user_group.clone(),
                config.user_shell.clone(),
            )),
        )
    };

    let arena = Arc::new(Arena::new(config, ledger, lightning, provisioner));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = GameMonitor::new(
        arena.config.xlogfile_path.clone(),
        arena.config.poll_interval,
    );
    let monitor_handle = tokio::spawn(monitor.run(arena.clone(), shutdown_rx));

    let api = Api::new(arena.clone());
    let listener = tokio::net::TcpListener::bind(arena.config.listen)
        .await
        .context("bind listen address")?;
    info!(addr = %arena.config.listen, "valhalla server listening");
    axum::serve(
        listener,
        api.router()
            .into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await
    .context("serve api")?;

    // Let the in-flight monitor tick finish before exiting.
    let _ = monitor_handle.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_args_build_a_config() {
        let args = Args::parse_from(["valhalla-server"]);
        let config = build_config(&args).expect("config should build");
        assert_eq!(config.ante_sats, 1000);
        assert_eq!(config.pot_seed_sats, 10_000);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.login_command, ["su", "--login"]);
        assert_eq!(config.win_keyword, "ascended");
    }

    #[test]
    fn zero_ante_is_rejected() {
        let args = Args::parse_from(["valhalla-server", "--ante-sats", "0"]);
        let err = build_config(&args).unwrap_err();
        assert!(err.to_string().contains("ante_sats"), "unexpected error: {err}");
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let args = Args::parse_from(["valhalla-server", "--poll-interval-secs", "0"]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn login_command_splits_into_argv() {
        let args = Args::parse_from([
            "valhalla-server",
            "--login-command",
            "ssh -t localhost",
        ]);
        let config = build_config(&args).expect("config should build");
        assert_eq!(config.login_command, ["ssh", "-t", "localhost"]);
    }
}
