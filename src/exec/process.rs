// src/exec/process.rs

//! Supervised external processes.
//!
//! A [`ManagedProcess`] wraps one OS process started from a [`LaunchSpec`].
//! Output handling has two modes:
//! - piped: stdout and stderr are read line by line by two reader tasks that
//!   feed one merged line stream and the bounded [`OutputBuffer`];
//! - file: both streams are appended to a log file, to be followed with a
//!   [`LogTailer`](crate::exec::LogTailer).
//!
//! Liveness is never cached: `is_alive` asks the OS every time.

use std::fs::OpenOptions;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use crate::errors::{Result, SplatError};
use crate::exec::launch::LaunchSpec;
use crate::exec::output::OutputBuffer;
use crate::exec::signal::{self, Signal};

/// Lines kept in a failure's diagnostics.
pub const DIAGNOSTIC_LINES: usize = 10;

/// Lines the merged stream holds before new lines are only kept in the
/// buffer.
const STREAM_CAPACITY: usize = 1024;

/// How long to wait for reader tasks to reach EOF once the process exited.
/// Grandchildren may keep the pipes open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where a process's stdout and stderr go.
#[derive(Debug, Clone)]
pub enum OutputMode {
    Piped,
    /// Append both streams to this file (parent directories are created).
    File(PathBuf),
}

/// Options for [`ManagedProcess::start`].
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub output: OutputMode,
    /// Put the child in its own process group so `stop` reaches everything
    /// it forks.
    pub process_group: bool,
    /// Buffer receiving output lines. A fresh one of capacity 200 if `None`.
    pub buffer: Option<OutputBuffer>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            output: OutputMode::Piped,
            process_group: false,
            buffer: None,
        }
    }
}

impl StartOptions {
    pub fn piped() -> Self {
        Self::default()
    }

    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            output: OutputMode::File(path.into()),
            ..Self::default()
        }
    }

    pub fn process_group(mut self, enabled: bool) -> Self {
        self.process_group = enabled;
        self
    }

    pub fn buffer(mut self, buffer: OutputBuffer) -> Self {
        self.buffer = Some(buffer);
        self
    }
}

/// Per-line callback used by [`ManagedProcess::spawn_monitor`].
pub type LineObserver = Box<dyn FnMut(&str) + Send + 'static>;

enum Handle {
    /// A child we spawned.
    Owned { child: Child, pid: u32 },
    /// A process started indirectly (e.g. by a wrapper that forked and
    /// exited); only its pid is known.
    Foreign { pid: u32 },
    Released,
}

struct Monitor {
    stop_tx: oneshot::Sender<()>,
    join: JoinHandle<mpsc::Receiver<String>>,
}

/// One supervised external process.
pub struct ManagedProcess {
    label: String,
    handle: Handle,
    process_group: bool,
    buffer: OutputBuffer,
    lines_rx: Option<mpsc::Receiver<String>>,
    readers: Vec<JoinHandle<()>>,
    monitor: Option<Monitor>,
    exit_code: Option<i32>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("label", &self.label)
            .field("pid", &self.pid())
            .field("process_group", &self.process_group)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

impl ManagedProcess {
    /// Launch `spec`.
    ///
    /// A missing required file, a missing executable or a spawn failure
    /// yields `SplatError::Launch`.
    pub fn start(spec: &LaunchSpec, options: StartOptions) -> Result<Self> {
        spec.check_launchable()?;

        let buffer = options.buffer.unwrap_or_default();
        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null());
        // Children of a separate process group outlive us on purpose.
        cmd.kill_on_drop(!options.process_group);
        if options.process_group {
            cmd.process_group(0);
        }

        match &options.output {
            OutputMode::Piped => {
                cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
            OutputMode::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                let err_file = file.try_clone()?;
                cmd.stdout(Stdio::from(file)).stderr(Stdio::from(err_file));
            }
        }

        let mut child = cmd.spawn().map_err(|e| SplatError::Launch {
            program: spec.label.clone(),
            reason: format!("spawning {}: {}", spec.program.display(), e),
        })?;

        let pid = child.id().ok_or_else(|| SplatError::Launch {
            program: spec.label.clone(),
            reason: "process exited before its pid could be read".to_string(),
        })?;

        info!(
            label = %spec.label,
            pid,
            cmd = %spec.command_line(),
            "started process"
        );

        let mut readers = Vec::new();
        let mut lines_rx = None;
        if matches!(options.output, OutputMode::Piped) {
            let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
            if let Some(stdout) = child.stdout.take() {
                readers.push(spawn_reader(
                    spec.label.clone(),
                    "stdout",
                    stdout,
                    buffer.clone(),
                    tx.clone(),
                ));
            }
            if let Some(stderr) = child.stderr.take() {
                readers.push(spawn_reader(
                    spec.label.clone(),
                    "stderr",
                    stderr,
                    buffer.clone(),
                    tx,
                ));
            }
            lines_rx = Some(rx);
        }

        Ok(Self {
            label: spec.label.clone(),
            handle: Handle::Owned { child, pid },
            process_group: options.process_group,
            buffer,
            lines_rx,
            readers,
            monitor: None,
            exit_code: None,
        })
    }

    /// Track a process we did not spawn. It has no output stream.
    pub fn adopt(label: impl Into<String>, pid: u32) -> Self {
        let label = label.into();
        info!(label = %label, pid, "adopted process");
        Self {
            label,
            handle: Handle::Foreign { pid },
            process_group: false,
            buffer: OutputBuffer::default(),
            lines_rx: None,
            readers: Vec::new(),
            monitor: None,
            exit_code: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> Option<u32> {
        match &self.handle {
            Handle::Owned { pid, .. } | Handle::Foreign { pid } => Some(*pid),
            Handle::Released => None,
        }
    }

    pub fn buffer(&self) -> &OutputBuffer {
        &self.buffer
    }

    /// Last `n` captured output lines.
    pub fn tail(&self, n: usize) -> Vec<String> {
        self.buffer.tail(n)
    }

    /// Whether the OS still reports the process as running.
    pub fn is_alive(&mut self) -> bool {
        match &mut self.handle {
            Handle::Owned { child, .. } => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    self.exit_code = Some(exit_code(status));
                    false
                }
                Err(e) => {
                    warn!(label = %self.label, error = %e, "try_wait failed");
                    false
                }
            },
            Handle::Foreign { pid } => signal::is_alive(*pid),
            Handle::Released => false,
        }
    }

    /// Exit code if the process has already exited, without blocking.
    ///
    /// Foreign processes report 0 once gone since their status is unknown.
    pub fn try_exit_code(&mut self) -> Option<i32> {
        if self.is_alive() {
            return None;
        }
        match self.handle {
            Handle::Foreign { .. } => Some(self.exit_code.unwrap_or(0)),
            _ => self.exit_code,
        }
    }

    /// Next merged output line, or `None` once both streams closed.
    ///
    /// Returns `None` immediately in file mode or while a monitor owns the
    /// stream.
    pub async fn read_output_line(&mut self) -> Option<String> {
        match self.lines_rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Drain the output stream in the background, calling `observer` (if
    /// any) with every line. Lines land in the buffer either way.
    ///
    /// Ends when the stream closes or on [`stop_monitor`](Self::stop_monitor).
    pub fn spawn_monitor(&mut self, observer: Option<LineObserver>) {
        let Some(mut rx) = self.lines_rx.take() else {
            debug!(label = %self.label, "no output stream to monitor");
            return;
        };

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let label = self.label.clone();
        let mut observer = observer;

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        trace!(label = %label, "monitor stop requested");
                        break;
                    }
                    line = rx.recv() => match line {
                        Some(line) => {
                            if let Some(observe) = observer.as_mut() {
                                observe(&line);
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!(label = %label, "output monitor ended");
            rx
        });

        self.monitor = Some(Monitor { stop_tx, join });
    }

    /// Stop the background monitor and take the stream back.
    pub async fn stop_monitor(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.stop_tx.send(());
            match monitor.join.await {
                Ok(rx) => self.lines_rx = Some(rx),
                Err(e) => warn!(label = %self.label, error = %e, "output monitor panicked"),
            }
        }
    }

    /// Wait for the process to exit.
    ///
    /// Exit code 0 returns `Ok(0)`; anything else is
    /// `SplatError::ProcessFailed` carrying the last lines of output.
    pub async fn wait(&mut self) -> Result<i32> {
        let code = match &mut self.handle {
            Handle::Owned { child, .. } => {
                let status = child.wait().await?;
                exit_code(status)
            }
            Handle::Foreign { pid } => {
                let pid = *pid;
                while signal::is_alive(pid) {
                    sleep(POLL_INTERVAL).await;
                }
                0
            }
            Handle::Released => {
                return Err(SplatError::Other(anyhow::anyhow!(
                    "process '{}' was already released",
                    self.label
                )));
            }
        };
        self.exit_code = Some(code);
        self.drain_readers().await;

        info!(label = %self.label, pid = ?self.pid(), exit_code = code, "process exited");

        if code == 0 {
            Ok(0)
        } else {
            Err(SplatError::ProcessFailed {
                label: self.label.clone(),
                code,
                tail: self.buffer.tail(DIAGNOSTIC_LINES),
            })
        }
    }

    /// Graceful stop: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Releases the handle and clears the buffer. Returns the exit code if
    /// one was observed.
    pub async fn stop(&mut self, grace: Duration) -> Result<Option<i32>> {
        self.stop_monitor().await;

        // A signal failure (EPERM on an adopted pid, say) still tears the
        // handle down; the first error is reported afterwards.
        let mut failure = None;
        if self.is_alive() {
            info!(label = %self.label, pid = ?self.pid(), ?grace, "stopping process");
            if let Err(e) = self.send(Signal::Term) {
                warn!(label = %self.label, pid = ?self.pid(), error = %e, "SIGTERM failed");
                failure.get_or_insert(e);
            }

            if timeout(grace, self.wait_exit()).await.is_err() {
                warn!(
                    label = %self.label,
                    pid = ?self.pid(),
                    "process ignored SIGTERM; sending SIGKILL"
                );
                if let Err(e) = self.send(Signal::Kill) {
                    warn!(label = %self.label, pid = ?self.pid(), error = %e, "SIGKILL failed");
                    failure.get_or_insert(e);
                }
                if timeout(grace.max(Duration::from_secs(1)), self.wait_exit())
                    .await
                    .is_err()
                {
                    warn!(label = %self.label, pid = ?self.pid(), "process still present after SIGKILL");
                }
            }
        }

        let code = self.release().await;
        match failure {
            Some(e) => Err(e),
            None => Ok(code),
        }
    }

    /// Immediate SIGKILL.
    pub async fn kill(&mut self) -> Result<Option<i32>> {
        self.stop_monitor().await;
        if self.is_alive() {
            info!(label = %self.label, pid = ?self.pid(), "killing process");
            if let Err(e) = self.send(Signal::Kill) {
                warn!(label = %self.label, pid = ?self.pid(), error = %e, "SIGKILL failed");
                self.release().await;
                return Err(e);
            }
            if timeout(Duration::from_secs(5), self.wait_exit()).await.is_err() {
                warn!(label = %self.label, pid = ?self.pid(), "process still present after SIGKILL");
            }
        }
        Ok(self.release().await)
    }

    fn send(&self, sig: Signal) -> Result<()> {
        let Some(pid) = self.pid() else {
            return Ok(());
        };
        if self.process_group {
            signal::send_group(pid, sig)?;
        } else {
            signal::send(pid, sig)?;
        }
        Ok(())
    }

    async fn wait_exit(&mut self) {
        match &mut self.handle {
            Handle::Owned { child, .. } => match child.wait().await {
                Ok(status) => self.exit_code = Some(exit_code(status)),
                Err(e) => warn!(label = %self.label, error = %e, "wait failed"),
            },
            Handle::Foreign { pid } => {
                let pid = *pid;
                while signal::is_alive(pid) {
                    sleep(POLL_INTERVAL).await;
                }
            }
            Handle::Released => {}
        }
    }

    async fn drain_readers(&mut self) {
        for reader in self.readers.drain(..) {
            if timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                trace!(label = %self.label, "output reader still open after exit");
            }
        }
    }

    async fn release(&mut self) -> Option<i32> {
        self.drain_readers().await;
        self.lines_rx = None;
        self.buffer.clear();
        self.handle = Handle::Released;
        self.exit_code
    }
}

fn spawn_reader<R>(
    label: String,
    stream: &'static str,
    source: R,
    buffer: OutputBuffer,
    tx: mpsc::Sender<String>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // Raw bytes: a child printing non-UTF-8 must not lose its reader,
        // or its next write dies with SIGPIPE.
        let mut reader = BufReader::new(source);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&raw);
                    debug!(label = %label, stream, "{}", line);
                    buffer.push(line.clone());
                    if tx.try_send(line).is_err() {
                        trace!(label = %label, stream, "line stream full or closed; kept in buffer only");
                    }
                }
                Err(e) => {
                    debug!(label = %label, stream, error = %e, "output reader error");
                    break;
                }
            }
        }
    })
}

fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Exit code, with death-by-signal mapped to `128 + signal` like a shell.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}
