// src/exec/tailer.rs

//! Follow a growing log file into an [`OutputBuffer`].

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, trace, warn};

use crate::errors::Result;
use crate::exec::output::OutputBuffer;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Background task appending every complete new line of a file to a buffer.
///
/// Starts at the current end of the file, so only output written after
/// `start` is seen. When the file shrinks (truncated or rotated in place)
/// reading restarts from offset 0.
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    stop_tx: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl LogTailer {
    /// Create the file (and its parent directories) if missing, then begin
    /// following it.
    pub async fn start(path: impl AsRef<Path>, buffer: OutputBuffer, poll: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .await?;
        let offset = file.seek(SeekFrom::End(0)).await?;

        debug!(path = %path.display(), offset, "log tailer started");

        let (stop_tx, stop_rx) = oneshot::channel();
        let join = tokio::spawn(follow(path.clone(), file, offset, buffer, poll, stop_rx));

        Ok(Self {
            path,
            stop_tx: Some(stop_tx),
            join: Some(join),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop following and wait for the background task to end.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(path = %self.path.display(), error = %e, "log tailer task failed");
            }
        }
        debug!(path = %self.path.display(), "log tailer stopped");
    }
}

impl Drop for LogTailer {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn follow(
    path: PathBuf,
    mut file: File,
    mut offset: u64,
    buffer: OutputBuffer,
    poll: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = interval(poll);
    // Bytes after the last newline, waiting for the rest of their line.
    let mut partial: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; 8192];

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {}
        }

        let len = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                trace!(path = %path.display(), error = %e, "log file not readable");
                continue;
            }
        };

        if len < offset {
            debug!(path = %path.display(), len, offset, "log file truncated; restarting from the beginning");
            // Reopen in case the file was replaced rather than truncated.
            match File::open(&path).await {
                Ok(reopened) => file = reopened,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "reopening log file failed");
                    continue;
                }
            }
            offset = 0;
            partial.clear();
        }

        if len == offset {
            continue;
        }

        if let Err(e) = file.seek(SeekFrom::Start(offset)).await {
            warn!(path = %path.display(), error = %e, "seeking log file failed");
            continue;
        }

        loop {
            match file.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    offset += n as u64;
                    partial.extend_from_slice(&chunk[..n]);
                    push_complete_lines(&mut partial, &buffer);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "reading log file failed");
                    break;
                }
            }
        }
    }
}

/// Longest unterminated line held back before it is flushed as is.
pub const MAX_PARTIAL_LINE: usize = 64 * 1024;

/// Move every finished line of `partial` into `buffer`.
///
/// `\n`, `\r\n` and a bare `\r` (progress bars redrawing in place) all end
/// a line. A trailing `\r` waits for the next read in case a `\n` follows.
fn push_complete_lines(partial: &mut Vec<u8>, buffer: &OutputBuffer) {
    let mut start = 0;
    let mut i = 0;
    while i < partial.len() {
        match partial[i] {
            b'\n' => {
                push_line(&partial[start..i], buffer);
                i += 1;
                start = i;
            }
            b'\r' if i + 1 == partial.len() => break,
            b'\r' => {
                push_line(&partial[start..i], buffer);
                i += if partial[i + 1] == b'\n' { 2 } else { 1 };
                start = i;
            }
            _ => i += 1,
        }
    }
    partial.drain(..start);

    if partial.len() > MAX_PARTIAL_LINE {
        trace!(len = partial.len(), "flushing overlong unterminated line");
        push_line(partial, buffer);
        partial.clear();
    }
}

fn push_line(line: &[u8], buffer: &OutputBuffer) {
    buffer.push(String::from_utf8_lossy(line).into_owned());
}
