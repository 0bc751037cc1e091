// src/ports/probe.rs

//! Discovering which processes listen on a TCP port.

use std::collections::HashSet;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::trace;

use crate::errors::{Result, SplatError};

/// Answers "which pids hold a listening TCP socket on this port".
///
/// Implementations are blocking; async callers go through
/// [`PortResolver`](crate::ports::PortResolver), which moves them onto the
/// blocking pool.
pub trait PortProbe: Send + Sync + Debug {
    /// Sorted, de-duplicated pids. Empty when the port is free.
    fn occupants(&self, port: u16) -> Result<Vec<u32>>;
}

/// Linux probe reading `/proc/net/tcp{,6}` and `/proc/<pid>/fd`.
#[derive(Debug, Clone)]
pub struct ProcNetProbe {
    root: PathBuf,
}

impl Default for ProcNetProbe {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl ProcNetProbe {
    /// Probe a procfs mounted (or mocked) at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn listening_inodes(&self, port: u16) -> HashSet<u64> {
        let mut inodes = HashSet::new();
        for table in ["tcp", "tcp6"] {
            let path = self.root.join("net").join(table);
            match fs::read_to_string(&path) {
                Ok(contents) => inodes.extend(parse_listening_inodes(&contents, port)),
                Err(e) => trace!(path = %path.display(), error = %e, "socket table unavailable"),
            }
        }
        inodes
    }

    fn pids_owning(&self, inodes: &HashSet<u64>) -> Result<Vec<u32>> {
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            if process_holds_any(&entry.path(), inodes) {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }
}

impl PortProbe for ProcNetProbe {
    fn occupants(&self, port: u16) -> Result<Vec<u32>> {
        let inodes = self.listening_inodes(port);
        if inodes.is_empty() {
            return Ok(Vec::new());
        }
        self.pids_owning(&inodes)
    }
}

/// Whether any fd of the process at `proc_dir` is one of `inodes`.
///
/// Processes we may not inspect (other users, exited meanwhile) are skipped.
fn process_holds_any(proc_dir: &Path, inodes: &HashSet<u64>) -> bool {
    let Ok(fds) = fs::read_dir(proc_dir.join("fd")) else {
        return false;
    };
    fds.flatten().any(|fd| {
        fs::read_link(fd.path())
            .ok()
            .and_then(|target| socket_inode(&target.to_string_lossy()))
            .is_some_and(|inode| inodes.contains(&inode))
    })
}

fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

/// Inodes of sockets in state LISTEN on `port` in a `/proc/net/tcp`-format
/// table.
pub fn parse_listening_inodes(contents: &str, port: u16) -> Vec<u64> {
    const TCP_LISTEN: &str = "0A";

    contents
        .lines()
        .skip(1)
        .filter_map(|row| {
            let fields: Vec<&str> = row.split_whitespace().collect();
            let local = fields.get(1)?;
            let state = fields.get(3)?;
            let inode: u64 = fields.get(9)?.parse().ok()?;

            let (_, hex_port) = local.rsplit_once(':')?;
            let local_port = u16::from_str_radix(hex_port, 16).ok()?;

            (local_port == port && *state == TCP_LISTEN && inode != 0).then_some(inode)
        })
        .collect()
}

/// Portable probe shelling out to `lsof`.
#[derive(Debug, Clone, Default)]
pub struct LsofProbe;

impl PortProbe for LsofProbe {
    fn occupants(&self, port: u16) -> Result<Vec<u32>> {
        let output = Command::new("lsof")
            .args(["-nP", "-t", &format!("-iTCP:{port}"), "-sTCP:LISTEN"])
            .output()
            .map_err(|e| SplatError::Launch {
                program: "lsof".to_string(),
                reason: e.to_string(),
            })?;

        // lsof exits 1 with no output when nothing matched.
        let mut pids: Vec<u32> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect();
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }
}

/// `/proc` when available, `lsof` otherwise.
pub fn default_probe() -> std::sync::Arc<dyn PortProbe> {
    if Path::new("/proc/net/tcp").exists() {
        std::sync::Arc::new(ProcNetProbe::default())
    } else {
        std::sync::Arc::new(LsofProbe)
    }
}
