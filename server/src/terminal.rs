//! Terminal bridge internals: the pty-backed login shell, inbound frame
//! decoding, and the graceful-then-forceful shutdown ladder.
//!
//! The game saves and exits on SIGHUP, so teardown always starts there and
//! only escalates (SIGTERM, then a forced kill) when the previous signal
//! did not produce an exit within its grace window.

use std::io::{self, Read, Write};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::Deserialize;
use thiserror::Error as ThisError;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

#[derive(Debug, ThisError)]
pub enum BridgeError {
    #[error("failed to open pty: {0}")]
    Pty(String),
    #[error("failed to spawn login shell: {0}")]
    Spawn(String),
}

/// An inbound WebSocket frame, decoded. Structured control messages ride
/// the same text channel as keystrokes; anything that is not a recognized
/// control message is literal terminal input.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundFrame {
    Input(String),
    Resize { cols: u16, rows: u16 },
}

#[derive(Deserialize)]
struct ControlMessage {
    #[serde(rename = "type")]
    kind: String,
    cols: Option<u16>,
    rows: Option<u16>,
    data: Option<String>,
}

pub fn parse_frame(text: &str) -> InboundFrame {
    if let Ok(control) = serde_json::from_str::<ControlMessage>(text) {
        match control.kind.as_str() {
            "resize" => {
                return InboundFrame::Resize {
                    cols: control.cols.unwrap_or(DEFAULT_COLS),
                    rows: control.rows.unwrap_or(DEFAULT_ROWS),
                }
            }
            "input" => return InboundFrame::Input(control.data.unwrap_or_default()),
            _ => {}
        }
    }
    InboundFrame::Input(text.to_string())
}

/// Handle for signalling the interactive process during teardown. The
/// escalation ladder runs against this trait so tests can drive it with a
/// fake process.
pub trait ProcessHandle: Send {
    /// First escalation step; the target treats it as "save and exit".
    fn signal_save_and_exit(&mut self) -> io::Result<()>;
    fn signal_terminate(&mut self) -> io::Result<()>;
    fn force_kill(&mut self) -> io::Result<()>;
    fn has_exited(&mut self) -> bool;
}

pub struct PtyProcess {
    child: Box<dyn Child + Send + Sync>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    pid: Option<u32>,
}

impl PtyProcess {
    fn signal(&self, signal: Signal) -> io::Result<()> {
        let Some(pid) = self.pid else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "process id unavailable",
            ));
        };
        kill(Pid::from_raw(pid as i32), signal)
            .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
    }
}

impl ProcessHandle for PtyProcess {
    fn signal_save_and_exit(&mut self) -> io::Result<()> {
        self.signal(Signal::SIGHUP)
    }

    fn signal_terminate(&mut self) -> io::Result<()> {
        self.signal(Signal::SIGTERM)
    }

    fn force_kill(&mut self) -> io::Result<()> {
        self.killer.kill()
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

/// Which rung of the ladder ended the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Escalation {
    SaveAndExit,
    Terminate,
    Kill,
    /// Exhausted every step without observing an exit.
    Abandoned,
}

#[derive(Clone, Copy, Debug)]
pub struct EscalationWaits {
    pub save_grace: Duration,
    pub term_grace: Duration,
    pub kill_grace: Duration,
}

impl Default for EscalationWaits {
    fn default() -> Self {
        EscalationWaits {
            save_grace: Duration::from_secs(5),
            term_grace: Duration::from_secs(2),
            kill_grace: Duration::from_secs(1),
        }
    }
}

async fn wait_for_exit(process: &mut dyn ProcessHandle, grace: Duration) -> bool {
    let deadline = Instant::now() + grace;
    loop {
        if process.has_exited() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Run the shutdown ladder to completion. Each step is attempted only when
/// the previous one did not produce an exit within its grace window.
pub async fn shutdown_process(
    process: &mut dyn ProcessHandle,
    waits: EscalationWaits,
) -> Escalation {
    if process.has_exited() {
        return Escalation::SaveAndExit;
    }

    if let Err(err) = process.signal_save_and_exit() {
        warn!(%err, "failed to send save-and-exit signal");
    }
    if wait_for_exit(process, waits.save_grace).await {
        return Escalation::SaveAndExit;
    }

    debug!("process ignored hangup, terminating");
    if let Err(err) = process.signal_terminate() {
        warn!(%err, "failed to send terminate signal");
    }
    if wait_for_exit(process, waits.term_grace).await {
        return Escalation::Terminate;
    }

    warn!("process ignored terminate, force killing");
    if let Err(err) = process.force_kill() {
        warn!(%err, "failed to force kill process");
    }
    if wait_for_exit(process, waits.kill_grace).await {
        Escalation::Kill
    } else {
        Escalation::Abandoned
    }
}

/// A login shell running under a pty, with its I/O pumped through channels
/// so the async bridge never blocks on the pty's synchronous reader and
/// writer.
pub struct ShellSession {
    pub master: Box<dyn MasterPty + Send>,
    pub process: PtyProcess,
    /// Chunks read from the pty, ending when the process closes it.
    pub output: mpsc::Receiver<Vec<u8>>,
    /// Bytes to feed to the process's stdin.
    pub input: mpsc::Sender<Vec<u8>>,
}

impl ShellSession {
    /// Spawn `command ... username` under a freshly sized pty.
    pub fn spawn(command: &[String], username: &str) -> Result<Self, BridgeError> {
        let Some((program, args)) = command.split_first() else {
            return Err(BridgeError::Spawn("empty login command".to_string()));
        };
        let pty = native_pty_system();
        let pair = pty
            .openpty(PtySize {
                rows: DEFAULT_ROWS,
                cols: DEFAULT_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|err| BridgeError::Pty(err.to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        for arg in args {
            cmd.arg(arg);
        }
        cmd.arg(username);
        cmd.env("TERM", "xterm-256color");
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|err| BridgeError::Spawn(err.to_string()))?;
        drop(pair.slave);

        let killer = child.clone_killer();
        let pid = child.process_id();

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|err| BridgeError::Pty(err.to_string()))?;
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(64);
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut writer = pair
            .master
            .take_writer()
            .map_err(|err| BridgeError::Pty(err.to_string()))?;
        let (in_tx, mut in_rx) = mpsc::channel::<Vec<u8>>(64);
        std::thread::spawn(move || {
            while let Some(data) = in_rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        Ok(ShellSession {
            master: pair.master,
            process: PtyProcess { child, killer, pid },
            output: out_rx,
            input: in_tx,
        })
    }
}
