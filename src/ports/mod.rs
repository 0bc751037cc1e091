// src/ports/mod.rs

//! TCP port conflict resolution.
//!
//! Before a listener is started on a fixed port, anything still holding it
//! (typically a stale viewer from an earlier run) is terminated: SIGTERM,
//! a grace period, then SIGKILL for survivors.

pub mod probe;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::errors::{Result, SplatError};
use crate::exec::signal::{self, Signal};

pub use probe::{default_probe, parse_listening_inodes, LsofProbe, PortProbe, ProcNetProbe};

/// How long to wait for SIGKILLed processes to release the port.
const KILL_SETTLE: Duration = Duration::from_secs(1);

/// Outcome of [`PortResolver::free`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FreeReport {
    /// Exited after SIGTERM.
    pub terminated: Vec<u32>,
    /// Needed SIGKILL.
    pub killed: Vec<u32>,
    /// Still holding the port afterwards.
    pub unresolved: Vec<u32>,
}

impl FreeReport {
    pub fn is_noop(&self) -> bool {
        self.terminated.is_empty() && self.killed.is_empty() && self.unresolved.is_empty()
    }

    /// `PortConflictUnresolved` if anything still holds the port.
    pub fn into_result(self, port: u16) -> Result<Self> {
        if self.unresolved.is_empty() {
            Ok(self)
        } else {
            Err(SplatError::PortConflictUnresolved {
                port,
                pids: self.unresolved,
            })
        }
    }
}

/// Result of [`PortResolver::wait_until_bound`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindWait {
    Bound(Vec<u32>),
    /// The liveness check reported the launching process gone first.
    Exited,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct PortResolver {
    probe: Arc<dyn PortProbe>,
    poll_interval: Duration,
}

impl Default for PortResolver {
    fn default() -> Self {
        Self::new(default_probe())
    }
}

impl PortResolver {
    pub fn new(probe: Arc<dyn PortProbe>) -> Self {
        Self {
            probe,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Pids listening on `port`.
    pub async fn occupants(&self, port: u16) -> Result<Vec<u32>> {
        let probe = Arc::clone(&self.probe);
        tokio::task::spawn_blocking(move || probe.occupants(port))
            .await
            .map_err(|e| SplatError::Other(anyhow::anyhow!("port probe task failed: {e}")))?
    }

    /// Terminate every process listening on `port` except ourselves.
    ///
    /// A free port is a no-op that sends no signal.
    pub async fn free(&self, port: u16, grace: Duration) -> Result<FreeReport> {
        let own_pid = std::process::id();
        let targets: Vec<u32> = self
            .occupants(port)
            .await?
            .into_iter()
            .filter(|pid| *pid != own_pid)
            .collect();

        if targets.is_empty() {
            debug!(port, "port already free");
            return Ok(FreeReport::default());
        }

        info!(port, pids = ?targets, "terminating processes holding port");
        for pid in &targets {
            if let Err(e) = signal::send(*pid, Signal::Term) {
                warn!(port, pid, error = %e, "SIGTERM failed");
            }
        }

        let deadline = Instant::now() + grace;
        while targets.iter().any(|pid| signal::is_alive(*pid)) && Instant::now() < deadline {
            sleep(self.poll_interval).await;
        }

        let (killed, terminated): (Vec<u32>, Vec<u32>) =
            targets.iter().partition(|pid| signal::is_alive(**pid));

        if !killed.is_empty() {
            warn!(port, pids = ?killed, "processes ignored SIGTERM; sending SIGKILL");
            for pid in &killed {
                if let Err(e) = signal::send(*pid, Signal::Kill) {
                    warn!(port, pid, error = %e, "SIGKILL failed");
                }
            }
            let settle = Instant::now() + KILL_SETTLE;
            while killed.iter().any(|pid| signal::is_alive(*pid)) && Instant::now() < settle {
                sleep(self.poll_interval).await;
            }
        }

        let unresolved: Vec<u32> = self
            .occupants(port)
            .await?
            .into_iter()
            .filter(|pid| *pid != own_pid)
            .collect();
        if !unresolved.is_empty() {
            warn!(port, pids = ?unresolved, "port still held after termination");
        }

        Ok(FreeReport {
            terminated,
            killed,
            unresolved,
        })
    }

    /// Poll until something listens on `port`, `timeout` elapses, or
    /// `still_running` returns `false`.
    pub async fn wait_until_bound<F>(
        &self,
        port: u16,
        timeout: Duration,
        still_running: F,
    ) -> Result<BindWait>
    where
        F: FnMut() -> bool,
    {
        self.wait_for_new_listener(port, timeout, &[], still_running).await
    }

    /// Like [`wait_until_bound`](Self::wait_until_bound), but listeners in
    /// `ignore` (holders that survived an earlier `free`) do not count.
    /// `Bound` carries only the new pids.
    pub async fn wait_for_new_listener<F>(
        &self,
        port: u16,
        timeout: Duration,
        ignore: &[u32],
        mut still_running: F,
    ) -> Result<BindWait>
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let pids: Vec<u32> = self
                .occupants(port)
                .await?
                .into_iter()
                .filter(|pid| !ignore.contains(pid))
                .collect();
            if !pids.is_empty() {
                debug!(port, pids = ?pids, "port bound");
                return Ok(BindWait::Bound(pids));
            }
            if !still_running() {
                return Ok(BindWait::Exited);
            }
            if Instant::now() >= deadline {
                return Ok(BindWait::TimedOut);
            }
            sleep(self.poll_interval).await;
        }
    }
}
