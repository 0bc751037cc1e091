// src/pipeline/pool.rs

//! Bounded job pool.
//!
//! Two semaphores:
//! - admission, `max_concurrent + max_queued` tickets; none left means the
//!   submission is rejected with `Busy` before a task exists;
//! - execution, `max_concurrent` permits; admitted jobs wait here.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ConfigFile;
use crate::errors::{Result, SplatError};

/// Proof of admission. Held until the job finishes.
#[derive(Debug)]
pub struct JobTicket {
    _permit: OwnedSemaphorePermit,
}

#[derive(Debug, Clone)]
pub struct JobPool {
    admission: Arc<Semaphore>,
    running: Arc<Semaphore>,
    capacity: usize,
    max_concurrent: usize,
}

impl JobPool {
    pub fn new(max_concurrent: usize, max_queued: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let capacity = max_concurrent + max_queued;
        Self {
            admission: Arc::new(Semaphore::new(capacity)),
            running: Arc::new(Semaphore::new(max_concurrent)),
            capacity,
            max_concurrent,
        }
    }

    pub fn from_config(cfg: &ConfigFile) -> Self {
        Self::new(cfg.pipeline.max_concurrent_jobs, cfg.pipeline.max_queued_jobs)
    }

    /// Reserve a slot, or `Busy` when every slot is taken.
    pub fn try_admit(&self) -> Result<JobTicket> {
        match Arc::clone(&self.admission).try_acquire_owned() {
            Ok(permit) => Ok(JobTicket { _permit: permit }),
            Err(_) => Err(SplatError::Busy {
                capacity: self.capacity,
            }),
        }
    }

    /// Run `job` once an execution permit is free. The ticket is released
    /// when the job ends.
    pub fn spawn<F>(&self, ticket: JobTicket, label: String, job: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            let permit = match running.acquire_owned().await {
                Ok(p) => p,
                Err(e) => {
                    warn!(job = %label, error = %e, "job pool closed; dropping job");
                    return;
                }
            };
            debug!(job = %label, "job started");
            job.await;
            drop(permit);
            drop(ticket);
            debug!(job = %label, "job finished");
        })
    }

    /// Admitted jobs, queued or running.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.admission.available_permits()
    }

    pub fn running(&self) -> usize {
        self.max_concurrent - self.running.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}
