//! PTY pool: lifecycle of interactive terminal sessions.
//!
//! [`PtyPool`] is the single authority for creating, writing to, resizing,
//! and closing PTY-backed shells. Each session runs three background tasks
//! (stdin writer, output reader, exit watcher), and all output and exit
//! notifications flow through one [`PtyEvent`] channel drained by the
//! gateway's fan-out task. Read loops are independent per session, so one
//! stalled session cannot starve the others.
//!
//! ## Validation
//!
//! The shell is only ever taken from a fixed allow-list of absolute paths;
//! PATH lookup is not trusted. A working directory must be absolute and free
//! of `..`. Invalid values are replaced with defaults (and logged), never
//! rejected, so a slightly misconfigured client still gets a terminal.

pub mod spawn;

use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::protocol::{PtyCreatePayload, PtySession};
use crate::util;

/// Shells a client may request, by exact absolute path.
const SHELL_ALLOWLIST: &[&str] = &[
    "/bin/zsh",
    "/bin/bash",
    "/bin/sh",
    "/usr/bin/zsh",
    "/usr/bin/bash",
    "/usr/local/bin/zsh",
    "/usr/local/bin/bash",
];

const FALLBACK_SHELL: &str = "/bin/zsh";

/// Events produced by PTY sessions, drained by the gateway fan-out task.
#[derive(Debug)]
pub enum PtyEvent {
    /// The PTY master yielded output.
    Data { session_id: String, data: String },
    /// The child terminated; the pool entry is already gone.
    Exit {
        session_id: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Internal bookkeeping for one live session.
struct PtyEntry {
    session: PtySession,
    pid: u32,
    /// Master fd kept alive for resize; I/O runs on dup'd descriptors.
    master: OwnedFd,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Manages the pool of live PTY sessions.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct PtyPool {
    sessions: Arc<RwLock<HashMap<String, PtyEntry>>>,
    events: mpsc::Sender<PtyEvent>,
}

impl PtyPool {
    pub fn new(events: mpsc::Sender<PtyEvent>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Spawn a new PTY-backed shell session.
    pub async fn create(&self, opts: PtyCreatePayload) -> Result<PtySession, String> {
        let cols = opts.cols.unwrap_or(80);
        let rows = opts.rows.unwrap_or(24);
        if cols == 0 || rows == 0 {
            return Err("cols and rows must be at least 1".to_string());
        }

        let shell = resolve_shell(opts.shell.as_deref());
        let cwd = resolve_cwd(opts.cwd.as_deref());

        // Held through the spawn so the exit watcher cannot observe the
        // child's death before the entry is inserted.
        let mut sessions = self.sessions.write().await;

        let pty = spawn::allocate_pty(cols, rows)
            .map_err(|e| format!("Failed to allocate PTY: {e}"))?;
        let mut child = spawn::spawn_shell(&pty, &shell, &cwd)
            .map_err(|e| format!("Failed to spawn {shell}: {e}"))?;
        let pid = child.id().unwrap_or(0);

        let session_id = Uuid::new_v4().to_string();
        let session = PtySession {
            id: session_id.clone(),
            name: opts.name.unwrap_or_else(|| "Terminal".to_string()),
            cols,
            rows,
            cwd,
            shell,
            created_at: util::now_ms(),
        };

        // Independent descriptors for the writer and reader tasks; the
        // original master stays in the entry for resize.
        let master_raw: RawFd = pty.master.as_raw_fd();
        let writer_fd = unsafe { libc::dup(master_raw) };
        if writer_fd < 0 {
            return Err(format!(
                "dup() failed for PTY master writer: {}",
                std::io::Error::last_os_error()
            ));
        }
        let reader_fd = unsafe { libc::dup(master_raw) };
        if reader_fd < 0 {
            unsafe {
                libc::close(writer_fd);
            }
            return Err(format!(
                "dup() failed for PTY master reader: {}",
                std::io::Error::last_os_error()
            ));
        }
        // SAFETY: we own these descriptors via dup.
        let master_write =
            tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(writer_fd) });
        let master_read =
            tokio::fs::File::from_std(unsafe { std::fs::File::from_raw_fd(reader_fd) });

        // stdin writer task: mpsc → PTY master
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        let stdin_task = tokio::spawn(async move {
            let mut writer = master_write;
            while let Some(data) = stdin_rx.recv().await {
                if writer.write_all(&data).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
        });

        // Output reader task: PTY master → event channel
        let sid_out = session_id.clone();
        let events_out = self.events.clone();
        let reader_task = tokio::spawn(async move {
            let mut reader = master_read;
            let mut tmp = [0u8; 4096];
            loop {
                match reader.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let data = String::from_utf8_lossy(&tmp[..n]).into_owned();
                        if events_out
                            .send(PtyEvent::Data {
                                session_id: sid_out.clone(),
                                data,
                            })
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
        });

        // Exit watcher: remove the entry, then announce the exit.
        let sid_exit = session_id.clone();
        let events_exit = self.events.clone();
        let sessions_exit = Arc::clone(&self.sessions);
        let exit_task = tokio::spawn(async move {
            let status = child.wait().await;
            sessions_exit.write().await.remove(&sid_exit);
            let (exit_code, signal) = match status {
                Ok(s) => (s.code(), s.signal()),
                Err(_) => (None, None),
            };
            info!("Session {sid_exit} exited (code {exit_code:?}, signal {signal:?})");
            let _ = events_exit
                .send(PtyEvent::Exit {
                    session_id: sid_exit,
                    exit_code,
                    signal,
                })
                .await;
        });

        let entry = PtyEntry {
            session: session.clone(),
            pid,
            master: pty.master,
            stdin_tx,
            tasks: vec![stdin_task, reader_task, exit_task],
        };

        sessions.insert(session_id.clone(), entry);
        info!(
            "Session {session_id} created ({} pid {pid}, {cols}x{rows}), total: {}",
            session.shell,
            sessions.len()
        );
        Ok(session)
    }

    /// Write bytes to a session's PTY master. Unknown ids are a silent no-op.
    pub async fn write(&self, session_id: &str, data: &[u8]) {
        let tx = {
            let sessions = self.sessions.read().await;
            sessions.get(session_id).map(|e| e.stdin_tx.clone())
        };
        if let Some(tx) = tx {
            let _ = tx.send(data.to_vec()).await;
        }
    }

    /// Update the kernel window size and the cached dimensions.
    /// Unknown ids are a silent no-op.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            return;
        }
        let mut sessions = self.sessions.write().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            if let Err(e) = spawn::resize_pty(&entry.master, cols, rows) {
                warn!("Session {session_id}: resize failed: {e}");
                return;
            }
            entry.session.cols = cols;
            entry.session.rows = rows;
        }
    }

    /// Terminate a session's process group and drop the pool entry.
    ///
    /// Returns `false` for unknown ids. The exit watcher still observes the
    /// child's death and emits [`PtyEvent::Exit`].
    pub async fn close(&self, session_id: &str) -> bool {
        let entry = self.sessions.write().await.remove(session_id);
        match entry {
            Some(entry) => {
                let pid = entry.pid;
                kill_group(pid, libc::SIGTERM);
                // Interactive shells routinely ignore SIGTERM; escalate once
                // the grace period passes.
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_secs(3)).await;
                    if process_alive(pid) {
                        kill_group(pid, libc::SIGKILL);
                    }
                });
                info!("Session {session_id} closed");
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<PtySession> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|e| e.session.clone())
    }

    pub async fn list(&self) -> Vec<PtySession> {
        self.sessions
            .read()
            .await
            .values()
            .map(|e| e.session.clone())
            .collect()
    }

    /// Whether a session id refers to a live PTY.
    pub async fn contains(&self, session_id: &str) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    /// Shutdown path: signal every child and abort the I/O tasks.
    pub async fn close_all(&self) {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        for (id, entry) in sessions.drain() {
            kill_group(entry.pid, libc::SIGTERM);
            kill_group(entry.pid, libc::SIGKILL);
            for task in &entry.tasks {
                task.abort();
            }
            info!("Session {id} closed (shutdown)");
        }
        if count > 0 {
            info!("Closed {count} session(s)");
        }
    }
}

/// Signal the session's process group (the shell is its leader).
fn kill_group(pid: u32, signal: i32) {
    #[allow(clippy::cast_possible_wrap)]
    let pgid = pid as i32;
    if pgid > 0 {
        unsafe {
            libc::kill(-pgid, signal);
        }
    }
}

/// Probe whether the child still exists (signal 0).
fn process_alive(pid: u32) -> bool {
    #[allow(clippy::cast_possible_wrap)]
    let pid = pid as i32;
    pid > 0 && unsafe { libc::kill(pid, 0) } == 0
}

/// Pick the shell to spawn: an exact allow-list match, or the default.
fn resolve_shell(requested: Option<&str>) -> String {
    if let Some(shell) = requested {
        if SHELL_ALLOWLIST.contains(&shell) {
            return shell.to_string();
        }
        warn!("Rejected shell {shell:?}, using default");
    }
    default_shell()
}

/// `$SHELL` when it is on the allow-list, `/bin/zsh` otherwise.
fn default_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if SHELL_ALLOWLIST.contains(&shell.as_str()) {
            return shell;
        }
    }
    FALLBACK_SHELL.to_string()
}

/// Pick the working directory: absolute and `..`-free, or the user home.
fn resolve_cwd(requested: Option<&str>) -> String {
    if let Some(cwd) = requested {
        if cwd.starts_with('/') && !cwd.contains("..") {
            return cwd.to_string();
        }
        warn!("Rejected cwd {cwd:?}, using home directory");
    }
    util::home_dir()
}
