// src/pipeline/stage.rs

//! Running one supervised process to completion inside a stage.

use std::time::Duration;

use tokio::time::{timeout_at, Instant};
use tracing::warn;

use crate::errors::{Result, SplatError};
use crate::exec::ManagedProcess;
use crate::types::Stage;

/// Grace period given to a process stopped because its stage timed out.
pub(crate) const TIMEOUT_STOP_GRACE: Duration = Duration::from_secs(5);

/// A stage-wide time limit shared by every process the stage runs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StageLimit {
    pub stage: Stage,
    pub timeout: Duration,
    pub deadline: Instant,
}

impl StageLimit {
    pub fn starting_now(stage: Stage, timeout: Option<Duration>) -> Option<Self> {
        timeout.map(|timeout| Self {
            stage,
            timeout,
            deadline: Instant::now() + timeout,
        })
    }
}

/// Wait for `process` to exit, stopping it if `limit` passes first.
pub(crate) async fn run_to_completion(
    process: &mut ManagedProcess,
    limit: Option<StageLimit>,
) -> Result<i32> {
    let Some(limit) = limit else {
        return process.wait().await;
    };

    match timeout_at(limit.deadline, process.wait()).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                stage = %limit.stage,
                label = %process.label(),
                timeout = ?limit.timeout,
                "stage timed out; stopping process"
            );
            process.stop(TIMEOUT_STOP_GRACE).await?;
            Err(SplatError::StageTimeout {
                stage: limit.stage.to_string(),
                timeout: limit.timeout,
            })
        }
    }
}
