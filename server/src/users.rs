//! OS account provisioning for play sessions.
//!
//! Each confirmed session gets a throwaway system user whose login shell
//! drops straight into the game; ending the session deletes the user again.
//! The system variant shells out to the usual admin commands; the mock
//! variant hands out ascending uids and records calls for tests and mock
//! deployments.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error as ThisError;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

#[derive(Debug, ThisError)]
pub enum ProvisionError {
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },
    #[error("io error running {command}: {source}")]
    Io {
        command: String,
        source: std::io::Error,
    },
    #[error("refusing to manage user without the '{prefix}' prefix: {username}")]
    BadPrefix { prefix: String, username: String },
    #[error("unparseable uid for {username}: {raw}")]
    BadUid { username: String, raw: String },
    #[error("mock provisioning failure")]
    MockFailure,
}

pub enum Provisioner {
    System(SystemProvisioner),
    Mock(MockProvisioner),
}

impl Provisioner {
    /// Create the OS account for a session and return its uid.
    pub async fn provision(&self, username: &str, password: &str) -> Result<u32, ProvisionError> {
        match self {
            Provisioner::System(system) => system.create_user(username, password).await,
            Provisioner::Mock(mock) => mock.create_user(username),
        }
    }

    /// Tear the account down again. Safe to call for users that are already
    /// gone.
    pub async fn deprovision(&self, username: &str) -> Result<(), ProvisionError> {
        match self {
            Provisioner::System(system) => system.delete_user(username).await,
            Provisioner::Mock(mock) => mock.delete_user(username),
        }
    }
}

pub struct SystemProvisioner {
    pub user_prefix: String,
    pub group: String,
    pub shell: PathBuf,
}

impl SystemProvisioner {
    pub fn new(user_prefix: String, group: String, shell: PathBuf) -> Self {
        SystemProvisioner {
            user_prefix,
            group,
            shell,
        }
    }

    fn check_prefix(&self, username: &str) -> Result<(), ProvisionError> {
        if username.starts_with(&self.user_prefix) {
            Ok(())
        } else {
            Err(ProvisionError::BadPrefix {
                prefix: self.user_prefix.clone(),
                username: username.to_string(),
            })
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, ProvisionError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| ProvisionError::Io {
                command: program.to_string(),
                source,
            })?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(ProvisionError::Command {
                command: program.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    async fn user_exists(&self, username: &str) -> bool {
        self.run("id", &[username]).await.is_ok()
    }

    async fn uid_of(&self, username: &str) -> Result<u32, ProvisionError> {
        let stdout = self.run("id", &["-u", username]).await?;
        let raw = stdout.trim().to_string();
        raw.parse::<u32>().map_err(|_| ProvisionError::BadUid {
            username: username.to_string(),
            raw,
        })
    }

    pub async fn create_user(&self, username: &str, password: &str) -> Result<u32, ProvisionError> {
        self.check_prefix(username)?;

        if self.user_exists(username).await {
            warn!(username, "user already exists, reusing");
            return self.uid_of(username).await;
        }

        let shell = self.shell.to_string_lossy().into_owned();
        self.run(
            "useradd",
            &[
                "-m",
                "-g",
                &self.group,
                "-s",
                &shell,
                "-c",
                "valhalla player",
                username,
            ],
        )
        .await?;

        if let Err(err) = self.set_password(username, password).await {
            // A user without a password is unreachable; undo the creation.
            let _ = self.delete_user(username).await;
            return Err(err);
        }

        let uid = self.uid_of(username).await?;
        info!(username, uid, "created player account");
        Ok(uid)
    }

    async fn set_password(&self, username: &str, password: &str) -> Result<(), ProvisionError> {
        // chpasswd only reads username:password pairs from stdin.
        let mut child = Command::new("chpasswd")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProvisionError::Io {
                command: "chpasswd".to_string(),
                source,
            })?;
        if let Some(mut stdin) = child.stdin.take() {
            let line = format!("{username}:{password}\n");
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|source| ProvisionError::Io {
                    command: "chpasswd".to_string(),
                    source,
                })?;
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|source| ProvisionError::Io {
                command: "chpasswd".to_string(),
                source,
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ProvisionError::Command {
                command: "chpasswd".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    pub async fn delete_user(&self, username: &str) -> Result<(), ProvisionError> {
        self.check_prefix(username)?;

        if !self.user_exists(username).await {
            warn!(username, "user does not exist, nothing to delete");
            return Ok(());
        }

        // Kill anything the user still owns, then give the processes a
        // moment to die before userdel complains about them.
        let _ = self.run("pkill", &["-u", username]).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        if self.run("userdel", &["-r", username]).await.is_err() {
            // -r fails when the home directory is already gone.
            self.run("userdel", &[username]).await?;
        }
        info!(username, "deleted player account");
        Ok(())
    }
}

/// In-memory provisioner handing out ascending uids.
pub struct MockProvisioner {
    next_uid: AtomicU32,
    fail: bool,
    pub created: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        MockProvisioner {
            next_uid: AtomicU32::new(10_000),
            fail: false,
            created: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }

    /// Mock whose calls all fail, for exercising the best-effort paths.
    pub fn failing() -> Self {
        MockProvisioner {
            fail: true,
            ..MockProvisioner::new()
        }
    }

    fn create_user(&self, username: &str) -> Result<u32, ProvisionError> {
        if self.fail {
            return Err(ProvisionError::MockFailure);
        }
        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed);
        self.created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(username.to_string());
        Ok(uid)
    }

    fn delete_user(&self, username: &str) -> Result<(), ProvisionError> {
        if self.fail {
            return Err(ProvisionError::MockFailure);
        }
        self.removed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(username.to_string());
        Ok(())
    }
}

impl Default for MockProvisioner {
    fn default() -> Self {
        Self::new()
    }
}
