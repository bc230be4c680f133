//! Core of the valhalla arena: session lifecycle, payment confirmation,
//! xlogfile monitoring, payout orchestration, and the browser terminal
//! bridge, plus the HTTP/WS API that exposes them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;
use subtle::ConstantTimeEq;
use valhalla_ledger::Ledger;
use valhalla_lightning::Lightning;

pub mod api;
pub mod completion;
pub mod confirm;
pub mod metrics;
pub mod monitor;
pub mod notify;
pub mod payout;
pub mod terminal;
pub mod users;
pub mod xlog;

use crate::metrics::ArenaMetrics;
use crate::notify::Notifier;
use crate::users::Provisioner;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub database_path: PathBuf,
    pub xlogfile_path: PathBuf,
    /// Entry fee charged per session, credited to the pot on confirmation.
    pub ante_sats: u64,
    /// Initial pot balance; also the floor the pot is drained to on payout.
    pub pot_seed_sats: u64,
    pub max_active_sessions: u64,
    /// Xlogfile poll interval.
    pub poll_interval: Duration,
    /// Terminal bridge idle window.
    pub idle_timeout: Duration,
    /// Substring of the death text that marks a winning game.
    pub win_keyword: String,
    pub user_prefix: String,
    pub user_group: String,
    pub user_shell: PathBuf,
    /// Program + arguments the bridge runs under a pty; the session
    /// username is appended.
    pub login_command: Vec<String>,
    /// Hostname advertised in ssh commands and notifications.
    pub hostname: String,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: Option<String>,
    pub http_rate_limit_per_second: Option<u64>,
    pub http_rate_limit_burst: Option<u32>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: SocketAddr::from(([0, 0, 0, 0], 8000)),
            database_path: PathBuf::from("/var/lib/valhalla/ledger.sqlite"),
            xlogfile_path: PathBuf::from("/var/games/nethack/xlogfile"),
            ante_sats: 1000,
            pot_seed_sats: 10_000,
            max_active_sessions: 100,
            poll_interval: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(300),
            win_keyword: xlog::DEFAULT_WIN_KEYWORD.to_string(),
            user_prefix: "nh_".to_string(),
            user_group: "games".to_string(),
            user_shell: PathBuf::from("/usr/local/bin/valhalla-shell.sh"),
            login_command: vec!["su".to_string(), "--login".to_string()],
            hostname: "localhost".to_string(),
            webhook_secret: None,
            http_rate_limit_per_second: None,
            http_rate_limit_burst: None,
        }
    }
}

/// Shared state behind every request handler and background task.
pub struct Arena {
    pub config: ServerConfig,
    pub ledger: Ledger,
    pub lightning: Lightning,
    pub provisioner: Provisioner,
    pub notifier: Notifier,
    pub metrics: ArenaMetrics,
}

impl Arena {
    pub fn new(
        config: ServerConfig,
        ledger: Ledger,
        lightning: Lightning,
        provisioner: Provisioner,
    ) -> Self {
        Arena {
            config,
            ledger,
            lightning,
            provisioner,
            notifier: Notifier::new(),
            metrics: ArenaMetrics::default(),
        }
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Throwaway login handle: prefix + 8 lowercase alphanumerics.
pub fn generate_username(prefix: &str) -> String {
    format!("{prefix}{}", random_string(8).to_lowercase())
}

pub fn generate_password() -> String {
    random_string(22)
}

pub fn generate_access_token() -> String {
    random_string(32)
}

/// Constant-time string comparison for bearer tokens and webhook
/// signatures. Length mismatches return false without leaking content.
pub fn constant_time_eq(expected: &str, presented: &str) -> bool {
    expected
        .as_bytes()
        .ct_eq(presented.as_bytes())
        .into()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_credentials_have_expected_shape() {
        let username = generate_username("nh_");
        assert!(username.starts_with("nh_"));
        assert_eq!(username.len(), 11);
        assert!(username
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));

        assert_eq!(generate_password().len(), 22);
        assert_eq!(generate_access_token().len(), 32);
        assert_ne!(generate_access_token(), generate_access_token());
    }

    #[test]
    fn constant_time_eq_matches_exactly() {
        assert!(constant_time_eq("secret-token", "secret-token"));
        assert!(!constant_time_eq("secret-token", "secret-tokeN"));
        assert!(!constant_time_eq("secret-token", "secret"));
        assert!(!constant_time_eq("", "x"));
        assert!(constant_time_eq("", ""));
    }
}
