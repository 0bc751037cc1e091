// src/viewer/session.rs

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::{Result, SplatError};
use crate::exec::tailer::DEFAULT_POLL_INTERVAL;
use crate::exec::{LaunchSpec, LogTailer, ManagedProcess, OutputBuffer, StartOptions, DIAGNOSTIC_LINES};
use crate::ports::{BindWait, PortResolver};
use crate::types::ViewerMode;
use crate::viewer::{SessionStart, SessionStatus, ViewerSettings};

const LABEL: &str = "viewer";

struct ActiveSession {
    process: ManagedProcess,
    tailer: Option<LogTailer>,
}

/// Read-side copy of the active session, behind its own short lock so
/// `status` never waits on a start in progress.
#[derive(Debug, Clone)]
struct SessionInfo {
    url: String,
    artifact: PathBuf,
    pid: u32,
}

/// Owns the single viewer session.
///
/// `start` and `stop` are serialised by an async mutex. Starting always
/// tears down the previous session first, then clears whatever else still
/// holds the port.
pub struct ViewerSessionManager {
    settings: ViewerSettings,
    resolver: PortResolver,
    session: AsyncMutex<Option<ActiveSession>>,
    info: Mutex<Option<SessionInfo>>,
    recent: OutputBuffer,
}

impl std::fmt::Debug for ViewerSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewerSessionManager")
            .field("port", &self.settings.port)
            .field("mode", &self.settings.mode)
            .finish_non_exhaustive()
    }
}

impl ViewerSessionManager {
    pub fn new(settings: ViewerSettings, resolver: PortResolver) -> Self {
        let recent = OutputBuffer::new(settings.recent_lines);
        Self {
            settings,
            resolver,
            session: AsyncMutex::new(None),
            info: Mutex::new(None),
            recent,
        }
    }

    pub fn settings(&self) -> &ViewerSettings {
        &self.settings
    }

    pub fn resolver(&self) -> &PortResolver {
        &self.resolver
    }

    /// Serve `artifact`, replacing any running session.
    pub async fn start(&self, artifact: &Path) -> SessionStart {
        let mut guard = self.session.lock().await;
        self.teardown(&mut guard).await;

        if !artifact.is_file() {
            warn!(artifact = %artifact.display(), "viewer artifact not found");
            return self.failed(SplatError::ArtifactMissing(artifact.to_path_buf()).to_string());
        }

        if let Some(reason) = self.settings.missing_program() {
            let url = self.settings.simulated_url(artifact);
            info!(%url, %reason, "viewer not installed; returning simulated session");
            return SessionStart::Simulated { url, reason };
        }

        let port = self.settings.port;
        match self.resolver.free(port, self.settings.stop_grace).await {
            Ok(report) => {
                if let Err(e) = report.into_result(port) {
                    warn!(port, error = %e, "starting viewer despite port conflict");
                }
            }
            Err(e) => warn!(port, error = %e, "could not inspect viewer port"),
        }
        // Whatever still listens now is not our viewer, whoever owns it.
        let stale = match self.resolver.occupants(port).await {
            Ok(pids) => pids,
            Err(e) => {
                debug!(port, error = %e, "port probe failed");
                Vec::new()
            }
        };

        match self.launch(artifact, &stale).await {
            Ok(active) => {
                let pid = active.process.pid().unwrap_or_default();
                let url = self.settings.base_url();
                self.set_info(Some(SessionInfo {
                    url: url.clone(),
                    artifact: artifact.to_path_buf(),
                    pid,
                }));
                *guard = Some(active);
                info!(port, pid, %url, "viewer started");
                SessionStart::Started { url, pid }
            }
            Err(e) => {
                warn!(port, error = %e, "viewer failed to start");
                self.failed(e.to_string())
            }
        }
    }

    /// Stop the session and anything else holding the viewer port.
    pub async fn stop(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        self.teardown(&mut guard).await;

        let report = self
            .resolver
            .free(self.settings.port, self.settings.stop_grace)
            .await?;
        if !report.is_noop() {
            info!(port = self.settings.port, ?report, "freed viewer port");
        }
        report.into_result(self.settings.port)?;
        Ok(())
    }

    /// Current view of the session. `running` is re-derived from the port.
    pub async fn status(&self) -> SessionStatus {
        let port = self.settings.port;
        let running = match self.resolver.occupants(port).await {
            Ok(pids) => !pids.is_empty(),
            Err(e) => {
                debug!(port, error = %e, "port probe failed");
                false
            }
        };
        let info = self.info.lock().unwrap_or_else(PoisonError::into_inner).clone();
        SessionStatus {
            running,
            port,
            url: info.as_ref().map(|i| i.url.clone()),
            artifact: info.as_ref().map(|i| i.artifact.clone()),
            pid: info.as_ref().map(|i| i.pid),
            recent_log_lines: self.recent.snapshot(),
        }
    }

    async fn launch(&self, artifact: &Path, stale: &[u32]) -> Result<ActiveSession> {
        let args = vec![
            "-s".to_string(),
            artifact.to_string_lossy().into_owned(),
            "--port".to_string(),
            self.settings.port.to_string(),
            "--host".to_string(),
            self.settings.bind_host.clone(),
        ];
        let spec = LaunchSpec::from_launcher(LABEL, &self.settings.launcher, args)?;

        let mut active = match self.settings.mode {
            ViewerMode::Attached => {
                let mut process =
                    ManagedProcess::start(&spec, StartOptions::piped().buffer(self.recent.clone()))?;
                process.spawn_monitor(None);
                ActiveSession {
                    process,
                    tailer: None,
                }
            }
            ViewerMode::Detached => {
                let log_file = &self.settings.log_file;
                let mut tailer =
                    LogTailer::start(log_file, self.recent.clone(), DEFAULT_POLL_INTERVAL).await?;
                let options = StartOptions::to_file(log_file).process_group(true);
                match ManagedProcess::start(&spec, options) {
                    Ok(process) => ActiveSession {
                        process,
                        tailer: Some(tailer),
                    },
                    Err(e) => {
                        tailer.stop().await;
                        return Err(e);
                    }
                }
            }
        };

        match self.await_bind(&mut active, stale).await {
            Ok(()) => Ok(active),
            Err(e) => {
                self.dispose(&mut active).await;
                Err(e)
            }
        }
    }

    /// Wait for the viewer to listen. Listeners in `stale` were there before
    /// the launch and never count as the viewer binding.
    ///
    /// A detached wrapper that exits 0 before the port is bound is assumed
    /// to have backgrounded the real viewer, in which case the new occupant
    /// is adopted.
    async fn await_bind(&self, active: &mut ActiveSession, stale: &[u32]) -> Result<()> {
        let port = self.settings.port;
        let timeout = self.settings.startup_timeout;
        let deadline = Instant::now() + timeout;

        let process = &mut active.process;
        let outcome = self
            .resolver
            .wait_for_new_listener(port, timeout, stale, || process.is_alive())
            .await?;

        let outcome = match outcome {
            BindWait::Exited if self.wrapper_exited_cleanly(process) => {
                debug!(port, "viewer launcher exited cleanly; waiting for background viewer");
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.resolver
                    .wait_for_new_listener(port, remaining, stale, || true)
                    .await?
            }
            other => other,
        };

        match outcome {
            BindWait::Bound(pids) => {
                if self.settings.mode == ViewerMode::Detached && !process.is_alive() {
                    if let Some(pid) = pids.first().copied() {
                        info!(port, pid, "adopting detached viewer process");
                        active.process = ManagedProcess::adopt(LABEL, pid);
                    }
                }
                Ok(())
            }
            BindWait::Exited => {
                // Collect the remaining output before reporting.
                let code = match process.wait().await {
                    Ok(code) => code,
                    Err(SplatError::ProcessFailed { code, .. }) => code,
                    Err(e) => return Err(e),
                };
                if self.settings.mode == ViewerMode::Detached {
                    tokio::time::sleep(DEFAULT_POLL_INTERVAL * 2).await;
                }
                Err(SplatError::ProcessFailed {
                    label: LABEL.to_string(),
                    code,
                    tail: self.recent.tail(DIAGNOSTIC_LINES),
                })
            }
            BindWait::TimedOut => Err(SplatError::ViewerStartTimeout { port, timeout }),
        }
    }

    fn wrapper_exited_cleanly(&self, process: &mut ManagedProcess) -> bool {
        self.settings.mode == ViewerMode::Detached && process.try_exit_code() == Some(0)
    }

    async fn teardown(&self, slot: &mut Option<ActiveSession>) {
        if let Some(mut active) = slot.take() {
            info!(pid = ?active.process.pid(), "stopping viewer session");
            self.dispose(&mut active).await;
        }
        self.set_info(None);
        self.recent.clear();
    }

    async fn dispose(&self, active: &mut ActiveSession) {
        if let Err(e) = active.process.stop(self.settings.stop_grace).await {
            warn!(error = %e, "stopping viewer process failed");
        }
        if let Some(tailer) = active.tailer.as_mut() {
            tailer.stop().await;
        }
    }

    fn set_info(&self, info: Option<SessionInfo>) {
        *self.info.lock().unwrap_or_else(PoisonError::into_inner) = info;
    }

    fn failed(&self, reason: String) -> SessionStart {
        SessionStart::Failed {
            reason,
            fallback_url: self.settings.fallback_url(),
        }
    }
}
