//! Background job registry: correlates `bgapi` Job-UUIDs with their
//! `BACKGROUND_JOB` result events.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{
    constants::MAX_UNCLAIMED_JOB_RESULTS,
    error::{EslError, EslResult},
    event::EslEvent,
};

type JobResult = EslResult<EslEvent>;

#[derive(Default)]
struct Jobs {
    /// Result slots still waiting for their event.
    pending: HashMap<String, oneshot::Sender<JobResult>>,
    /// Receivers not yet claimed by a caller.
    waiters: HashMap<String, oneshot::Receiver<JobResult>>,
    /// Delivered results nobody has collected, oldest first.
    unclaimed: VecDeque<String>,
    closed: bool,
}

impl Jobs {
    fn forget_unclaimed(&mut self, job_uuid: &str) {
        self.unclaimed
            .retain(|id| id != job_uuid);
    }
}

/// Shared between the reader task (fulfils) and caller tasks (register/await).
pub(crate) struct BackgroundJobRegistry {
    jobs: Mutex<Jobs>,
    max_unclaimed: usize,
}

impl Default for BackgroundJobRegistry {
    fn default() -> Self {
        Self::with_capacity(MAX_UNCLAIMED_JOB_RESULTS)
    }
}

impl BackgroundJobRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registry keeping at most `max_unclaimed` delivered results.
    pub(crate) fn with_capacity(max_unclaimed: usize) -> Self {
        Self {
            jobs: Mutex::default(),
            max_unclaimed,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Jobs> {
        self.jobs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a result slot for `job_uuid`. Fails once the connection is torn down.
    pub(crate) fn register(&self, job_uuid: &str) -> EslResult<()> {
        let mut jobs = self.lock();
        if jobs.closed {
            return Err(EslError::ConnectionClosed);
        }
        if jobs
            .pending
            .contains_key(job_uuid)
            || jobs
                .waiters
                .contains_key(job_uuid)
        {
            return Err(EslError::protocol_error(format!(
                "job {} already registered",
                job_uuid
            )));
        }
        let (tx, rx) = oneshot::channel();
        jobs.pending
            .insert(job_uuid.to_string(), tx);
        jobs.waiters
            .insert(job_uuid.to_string(), rx);
        debug!("[JOB] registered {}", job_uuid);
        Ok(())
    }

    /// Deliver the result event. Returns `false` for unknown or late job ids.
    ///
    /// A result nobody is waiting on yet is kept until collected; past the
    /// unclaimed limit the oldest such result is discarded.
    pub(crate) fn fulfill(&self, job_uuid: &str, event: EslEvent) -> bool {
        let mut jobs = self.lock();
        let slot = jobs
            .pending
            .remove(job_uuid);
        match slot {
            Some(tx) => {
                debug!("[JOB] fulfilled {}", job_uuid);
                // The receiver may have been dropped by a caller that gave up.
                let _ = tx.send(Ok(event));
                if jobs
                    .waiters
                    .contains_key(job_uuid)
                {
                    jobs.unclaimed
                        .push_back(job_uuid.to_string());
                    while jobs
                        .unclaimed
                        .len()
                        > self.max_unclaimed
                    {
                        if let Some(oldest) = jobs
                            .unclaimed
                            .pop_front()
                        {
                            warn!("[JOB] discarding uncollected result of {}", oldest);
                            jobs.waiters
                                .remove(&oldest);
                        }
                    }
                }
                true
            }
            None => {
                warn!("[JOB] result for unknown job {}", job_uuid);
                false
            }
        }
    }

    /// Fail every unfulfilled job. Idempotent; already delivered results stay claimable.
    pub(crate) fn cancel_all(&self, reason: impl Fn() -> EslError) {
        let mut jobs = self.lock();
        jobs.closed = true;
        let cancelled: Vec<_> = jobs
            .pending
            .drain()
            .collect();
        if !cancelled.is_empty() {
            debug!("[JOB] cancelling {} pending jobs", cancelled.len());
        }
        for (job_uuid, tx) in cancelled {
            let _ = tx.send(Err(reason()));
            jobs.waiters
                .remove(&job_uuid);
        }
    }

    /// Wait for the result of `job_uuid`.
    ///
    /// On timeout the waiter is put back so the caller may wait again.
    pub(crate) async fn wait(&self, job_uuid: &str, deadline: Option<Duration>) -> JobResult {
        let mut rx = {
            let mut jobs = self.lock();
            match jobs
                .waiters
                .remove(job_uuid)
            {
                Some(rx) => {
                    jobs.forget_unclaimed(job_uuid);
                    rx
                }
                None if jobs.closed => return Err(EslError::ConnectionClosed),
                None => {
                    return Err(EslError::UnknownJob {
                        job_uuid: job_uuid.to_string(),
                    })
                }
            }
        };

        let received = match deadline {
            Some(limit) => match tokio::time::timeout(limit, &mut rx).await {
                Ok(received) => received,
                Err(_) => {
                    let mut jobs = self.lock();
                    // The result may have landed between the timeout and this lock.
                    if !jobs
                        .pending
                        .contains_key(job_uuid)
                        && !jobs.closed
                    {
                        jobs.unclaimed
                            .push_back(job_uuid.to_string());
                    }
                    jobs.waiters
                        .insert(job_uuid.to_string(), rx);
                    return Err(EslError::Timeout {
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
            None => rx.await,
        };

        // Sender dropped without a value: registry torn down mid-wait.
        received.unwrap_or(Err(EslError::ConnectionClosed))
    }

    /// `true` while a result slot for `job_uuid` awaits its event.
    pub(crate) fn is_registered(&self, job_uuid: &str) -> bool {
        self.lock()
            .pending
            .contains_key(job_uuid)
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.lock()
            .pending
            .len()
    }

    /// Results delivered but not yet collected by a caller.
    pub(crate) fn unclaimed_count(&self) -> usize {
        self.lock()
            .unclaimed
            .len()
    }
}
