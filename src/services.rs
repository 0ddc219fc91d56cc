//! Managed child services.
//!
//! [`ServiceSupervisor`] runs the child processes declared in the
//! configuration: start/stop/restart on command, a SIGTERM → 10 s → SIGKILL
//! stop sequence, and an automatic restart 5 s after a non-zero exit when the
//! definition opts in. Every state transition and every chunk of child output
//! is pushed onto one [`ServiceEvent`] channel drained by the gateway's
//! fan-out task.
//!
//! State machine per service:
//!
//! ```text
//! stopped ──start──▶ starting ──spawn ok──▶ running
//! running ──stop──▶ (SIGTERM, wait ≤10s, SIGKILL) ──▶ stopped
//! running ──child exits──▶ stopped (+ scheduled restart on failure)
//! any     ──spawn fail──▶ error
//! ```
//!
//! A `stop` in flight cancels any pending auto-restart.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

use crate::config::ServiceDefinition;
use crate::protocol::ServiceStatusInfo;

/// Grace period between SIGTERM and SIGKILL on stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Delay before an automatic restart after a failure exit.
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Events produced by services, drained by the gateway fan-out task.
#[derive(Debug)]
pub enum ServiceEvent {
    /// A state transition; carries the full status snapshot.
    Status(ServiceStatusInfo),
    /// A chunk of child stdout or stderr.
    Output {
        id: String,
        /// `"stdout"` or `"stderr"`.
        stream: &'static str,
        data: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Stopped,
    Starting,
    Running,
    Error,
}

impl ServiceState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
        }
    }
}

struct ServiceEntry {
    def: ServiceDefinition,
    state: ServiceState,
    pid: Option<u32>,
    started_at: Option<Instant>,
    last_error: Option<String>,
    /// Set while a stop is in flight; suppresses auto-restart.
    stopping: bool,
    /// Pending auto-restart timer, aborted by `stop`.
    restart_task: Option<tokio::task::JoinHandle<()>>,
}

impl ServiceEntry {
    fn snapshot(&self) -> ServiceStatusInfo {
        #[allow(clippy::cast_possible_truncation)]
        let uptime = self
            .started_at
            .filter(|_| self.state == ServiceState::Running)
            .map(|t| t.elapsed().as_millis() as u64);
        ServiceStatusInfo {
            id: self.def.id.clone(),
            name: self.def.name.clone(),
            status: self.state.as_str().to_string(),
            pid: self.pid,
            uptime,
            last_error: self.last_error.clone(),
        }
    }
}

/// Supervises the configured child services.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone)]
pub struct ServiceSupervisor {
    services: Arc<RwLock<HashMap<String, ServiceEntry>>>,
    events: mpsc::Sender<ServiceEvent>,
}

impl ServiceSupervisor {
    pub fn new(events: mpsc::Sender<ServiceEvent>) -> Self {
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Register a service definition. Duplicate ids are rejected.
    pub async fn register(&self, def: ServiceDefinition) -> Result<(), String> {
        let mut services = self.services.write().await;
        if services.contains_key(&def.id) {
            return Err(format!("Service {} already registered", def.id));
        }
        let id = def.id.clone();
        services.insert(
            id.clone(),
            ServiceEntry {
                def,
                state: ServiceState::Stopped,
                pid: None,
                started_at: None,
                last_error: None,
                stopping: false,
                restart_task: None,
            },
        );
        info!("Service {id} registered");
        Ok(())
    }

    /// Whether a service id is known.
    pub async fn is_registered(&self, id: &str) -> bool {
        self.services.read().await.contains_key(id)
    }

    /// Spawn a service's child process.
    pub async fn start(&self, id: &str) -> Result<(), String> {
        let (def, starting_status) = {
            let mut services = self.services.write().await;
            let entry = services
                .get_mut(id)
                .ok_or_else(|| format!("Service {id} not registered"))?;
            if matches!(entry.state, ServiceState::Starting | ServiceState::Running) {
                return Err(format!("Service {id} is already running"));
            }
            if let Some(task) = entry.restart_task.take() {
                task.abort();
            }
            entry.state = ServiceState::Starting;
            entry.stopping = false;
            entry.last_error = None;
            (entry.def.clone(), entry.snapshot())
        };
        self.emit_status(starting_status).await;

        let mut cmd = Command::new(&def.command);
        cmd.args(&def.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = def.cwd {
            cmd.current_dir(cwd);
        }
        if let Some(ref env) = def.env {
            cmd.envs(env);
        }
        // SAFETY: setpgid is async-signal-safe per POSIX. The child leads its
        // own process group so signals reach its whole tree.
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let msg = format!("Failed to spawn {}: {e}", def.command);
                let status = {
                    let mut services = self.services.write().await;
                    let entry = services.get_mut(id).ok_or_else(|| msg.clone())?;
                    entry.state = ServiceState::Error;
                    entry.last_error = Some(msg.clone());
                    entry.snapshot()
                };
                warn!("Service {id}: {msg}");
                self.emit_status(status).await;
                return Err(msg);
            }
        };

        let pid = child.id().unwrap_or(0);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let running_status = {
            let mut services = self.services.write().await;
            let entry = services
                .get_mut(id)
                .ok_or_else(|| format!("Service {id} not registered"))?;
            if entry.stopping {
                // A stop raced the spawn; don't let the child linger.
                terminate_group(pid, libc::SIGKILL);
                entry.state = ServiceState::Stopped;
                return Err(format!("Service {id} stopped during start"));
            }
            entry.state = ServiceState::Running;
            entry.pid = Some(pid);
            entry.started_at = Some(Instant::now());
            entry.snapshot()
        };
        info!("Service {id} running (pid {pid})");
        self.emit_status(running_status).await;

        if let Some(stdout) = stdout {
            self.spawn_pump(id.to_string(), "stdout", stdout);
        }
        if let Some(stderr) = stderr {
            self.spawn_pump(id.to_string(), "stderr", stderr);
        }

        // Exit watcher: records the exit and schedules a restart on failure.
        let sup = self.clone();
        let watch_id = id.to_string();
        tokio::spawn(async move {
            let status = child.wait().await;
            let exit_code = status.as_ref().ok().and_then(|s| s.code());
            info!("Service {watch_id} exited (code {exit_code:?})");

            let (stopped_status, schedule_restart) = {
                let mut services = sup.services.write().await;
                let Some(entry) = services.get_mut(&watch_id) else {
                    return;
                };
                entry.state = ServiceState::Stopped;
                entry.pid = None;
                entry.started_at = None;
                let restart = !entry.stopping
                    && entry.def.restart_on_failure
                    && exit_code != Some(0);
                if restart {
                    entry.restart_task = Some(sup.schedule_restart(watch_id.clone()));
                }
                (entry.snapshot(), restart)
            };
            sup.emit_status(stopped_status).await;
            if schedule_restart {
                info!(
                    "Service {watch_id} failed, restarting in {}s",
                    RESTART_DELAY.as_secs()
                );
            }
        });

        Ok(())
    }

    /// Stop a service: SIGTERM, wait up to [`STOP_TIMEOUT`], then SIGKILL.
    /// Cancels any pending auto-restart.
    pub async fn stop(&self, id: &str) -> Result<(), String> {
        let pid = {
            let mut services = self.services.write().await;
            let entry = services
                .get_mut(id)
                .ok_or_else(|| format!("Service {id} not registered"))?;
            entry.stopping = true;
            if let Some(task) = entry.restart_task.take() {
                task.abort();
            }
            match entry.pid {
                Some(pid) => pid,
                None => {
                    if entry.state == ServiceState::Starting {
                        // A spawn is in flight; `stopping` stays set so the
                        // starter reaps the child as soon as it appears.
                        return Ok(());
                    }
                    // Not running; a cancelled restart leaves it stopped.
                    let changed = entry.state != ServiceState::Stopped;
                    entry.state = ServiceState::Stopped;
                    entry.stopping = false;
                    let status = entry.snapshot();
                    drop(services);
                    if changed {
                        self.emit_status(status).await;
                    }
                    return Ok(());
                }
            }
        };

        terminate_group(pid, libc::SIGTERM);

        // Wait for the exit watcher to observe the death.
        let deadline = tokio::time::Instant::now() + STOP_TIMEOUT;
        loop {
            if self.state_of(id).await != Some(ServiceState::Running) {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Service {id}: SIGTERM timeout, sending SIGKILL");
                terminate_group(pid, libc::SIGKILL);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Give the SIGKILL a moment to register before declaring victory.
        let kill_deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while self.state_of(id).await == Some(ServiceState::Running)
            && tokio::time::Instant::now() < kill_deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut services = self.services.write().await;
        if let Some(entry) = services.get_mut(id) {
            entry.stopping = false;
        }
        Ok(())
    }

    /// Stop then start.
    pub async fn restart(&self, id: &str) -> Result<(), String> {
        self.stop(id).await?;
        self.start(id).await
    }

    /// Status snapshot for one service.
    pub async fn status(&self, id: &str) -> Option<ServiceStatusInfo> {
        self.services.read().await.get(id).map(ServiceEntry::snapshot)
    }

    /// Status snapshots for every registered service.
    pub async fn list_all(&self) -> Vec<ServiceStatusInfo> {
        self.services
            .read()
            .await
            .values()
            .map(ServiceEntry::snapshot)
            .collect()
    }

    /// Shutdown path: stop every service.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.services.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                warn!("Service {id}: stop failed during shutdown: {e}");
            }
        }
    }

    async fn state_of(&self, id: &str) -> Option<ServiceState> {
        self.services.read().await.get(id).map(|e| e.state)
    }

    async fn emit_status(&self, status: ServiceStatusInfo) {
        let _ = self.events.send(ServiceEvent::Status(status)).await;
    }

    /// Pump one child stream into the event channel, chunk by chunk.
    fn spawn_pump(
        &self,
        id: String,
        stream: &'static str,
        mut reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    ) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut tmp = [0u8; 4096];
            loop {
                match reader.read(&mut tmp).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let data = String::from_utf8_lossy(&tmp[..n]).into_owned();
                        if events
                            .send(ServiceEvent::Output {
                                id: id.clone(),
                                stream,
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
    }

    /// Arm the post-failure restart timer.
    fn schedule_restart(&self, id: String) -> tokio::task::JoinHandle<()> {
        let sup = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RESTART_DELAY).await;
            // Boxed to break the start → exit watcher → restart cycle.
            if let Err(e) = Box::pin(sup.start(&id)).await {
                warn!("Service {id}: auto-restart failed: {e}");
            }
        })
    }
}

/// Signal a service's process group.
fn terminate_group(pid: u32, signal: i32) {
    #[allow(clippy::cast_possible_wrap)]
    let pgid = pid as i32;
    if pgid > 0 {
        unsafe {
            libc::kill(-pgid, signal);
        }
    }
}
