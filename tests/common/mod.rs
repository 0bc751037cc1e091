// tests/common/mod.rs

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use splatpipe::registry::{Task, TaskRegistry};

pub use splatpipe_test_utils::builders::ConfigFileBuilder;
pub use splatpipe_test_utils::{init_tracing, with_timeout};

/// Write a shell script. Run it through `sh <path>` rather than executing
/// it directly, which avoids ETXTBSY races with concurrently forking tests.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    path
}

/// Write a small fake video file.
pub fn write_video(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, b"not really a video").unwrap();
    path
}

pub fn has_python3() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Whether `/proc`-based port probing works here.
pub fn has_procfs() -> bool {
    Path::new("/proc/net/tcp").exists()
}

/// A port that was free a moment ago.
pub fn unused_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Python script that listens on `--port` until killed. Ignores `-s`.
pub const PY_LISTENER: &str = r#"
import argparse, socket, sys, time
p = argparse.ArgumentParser()
p.add_argument("-s")
p.add_argument("--port", type=int)
p.add_argument("--host", default="127.0.0.1")
a = p.parse_args()
s = socket.socket(socket.AF_INET, socket.SOCK_STREAM)
s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)
s.bind(("127.0.0.1", a.port))
s.listen(1)
print("serving", a.s, "on", a.port, flush=True)
while True:
    time.sleep(1)
"#;

/// Poll the registry until `pred` holds for task `id`.
pub async fn wait_for_task<F>(registry: &TaskRegistry, id: &str, pred: F) -> Task
where
    F: Fn(&Task) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(task) = registry.get(id) {
            if pred(&task) {
                return task;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {id} did not reach expected state; last: {:?}",
            registry.get(id)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
