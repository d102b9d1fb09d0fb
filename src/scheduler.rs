//! Transform Scheduler
//!
//! Concurrent coordinator over in-flight transform jobs. The job table
//! keyed by `TransformKey` is the single serialization point: two
//! concurrent requests for the same key converge on one job, and every
//! waiter observes the same single outcome. Registry snapshots and
//! representations are immutable, so nothing else needs locking.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{RunnerError, TransformError};
use crate::representation::Representation;
use crate::runner::{JobSpec, RunnerBinding, RunnerCatalog};
use crate::transform::{JobState, TransformJob, TransformKey, TransformRequest};

/// Backoff between retry attempts: exponential from `base`, capped at `max`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let backoff = self.base_backoff.saturating_mul(1u32 << exp);
        backoff.min(self.max_backoff)
    }
}

type JobOutcome = Result<Representation, TransformError>;

struct JobSlot {
    job: TransformJob,
    done: watch::Sender<Option<JobOutcome>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

/// A caller's attachment to one job. Cheap to clone; dropping a handle
/// detaches the waiter without affecting the job.
#[derive(Clone)]
pub struct TransformHandle {
    key: TransformKey,
    rx: watch::Receiver<Option<JobOutcome>>,
}

impl TransformHandle {
    pub fn key(&self) -> &TransformKey {
        &self.key
    }
}

struct SchedulerInner {
    catalog: RunnerCatalog,
    retry: RetryPolicy,
    max_output_bytes: u64,
    jobs: Mutex<HashMap<TransformKey, JobSlot>>,
}

/// The scheduler. Cloneable; clones share the job table.
#[derive(Clone)]
pub struct TransformScheduler {
    inner: Arc<SchedulerInner>,
}

impl TransformScheduler {
    pub fn new(catalog: RunnerCatalog, retry: RetryPolicy, max_output_bytes: u64) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                catalog,
                retry,
                max_output_bytes,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn with_catalog(catalog: RunnerCatalog) -> Self {
        Self::new(catalog, RetryPolicy::default(), 64 * 1024 * 1024)
    }

    /// Submit a transform request. Non-blocking: returns a handle
    /// immediately, deduplicating against any job with the same key.
    pub fn submit(&self, request: TransformRequest) -> Result<TransformHandle, TransformError> {
        let binding = self
            .inner
            .catalog
            .binding(&request.operation)
            .cloned()
            .ok_or_else(|| TransformError::UnknownOperation(request.operation.clone()))?;
        let key = TransformKey::compute(&request, &binding.tool_image);

        let mut jobs = self.inner.jobs.lock().expect("job table poisoned");
        if let Some(slot) = jobs.get_mut(&key) {
            match slot.job.state {
                JobState::Succeeded | JobState::Queued | JobState::Running => {
                    // Attach to the existing job; a succeeded job's channel
                    // already carries its result.
                    return Ok(TransformHandle { key, rx: slot.done.subscribe() });
                }
                JobState::Failed => {
                    if slot.job.attempts < request.max_attempts {
                        // Under the (possibly raised) retry budget: requeue,
                        // preserving the key and the attempt count.
                        debug!(%key, attempts = slot.job.attempts, "requeueing failed transform");
                        let (tx, rx) = watch::channel(None);
                        slot.done = tx;
                        slot.job.state = JobState::Queued;
                        slot.job.last_error = None;
                        let task = self.spawn_job(key.clone(), request, binding);
                        slot.task = Some(task);
                        return Ok(TransformHandle { key, rx });
                    }
                    // Over budget: terminal error, no re-attempt.
                    return Ok(TransformHandle { key, rx: slot.done.subscribe() });
                }
            }
        }

        // Insert the slot before spawning and keep the table locked until
        // both are done: the spawned task's first table access cannot
        // observe a missing slot.
        let (tx, rx) = watch::channel(None);
        jobs.insert(
            key.clone(),
            JobSlot {
                job: TransformJob::queued(key.clone()),
                done: tx,
                task: None,
            },
        );
        let task = self.spawn_job(key.clone(), request, binding);
        if let Some(slot) = jobs.get_mut(&key) {
            slot.task = Some(task);
        }
        debug!(%key, "transform job queued");
        Ok(TransformHandle { key, rx })
    }

    /// Wait for a job to reach a terminal state, up to `timeout`.
    ///
    /// A timeout cancels only this caller's wait; the job keeps running
    /// and other waiters stay attached.
    pub async fn wait(
        &self,
        handle: &TransformHandle,
        timeout: Duration,
    ) -> Result<Representation, TransformError> {
        let mut rx = handle.rx.clone();
        let outcome = tokio::time::timeout(timeout, async {
            loop {
                if let Some(outcome) = rx.borrow().clone() {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return Err(TransformError::Cancelled { key: handle.key.clone() });
                }
            }
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => Err(TransformError::AwaitTimeout { key: handle.key.clone() }),
        }
    }

    /// Convenience: submit and wait in one call
    pub async fn run_to_completion(
        &self,
        request: TransformRequest,
        timeout: Duration,
    ) -> Result<Representation, TransformError> {
        let handle = self.submit(request)?;
        self.wait(&handle, timeout).await
    }

    /// Advisory cancellation. Only permitted when no waiters remain; the
    /// in-flight attempt is terminated best-effort.
    pub fn cancel_if_unwatched(&self, key: &TransformKey) -> bool {
        let mut jobs = self.inner.jobs.lock().expect("job table poisoned");
        let Some(slot) = jobs.get_mut(key) else { return false };
        if slot.job.is_terminal() || slot.done.receiver_count() > 0 {
            return false;
        }
        if let Some(task) = slot.task.take() {
            task.abort();
        }
        slot.job.state = JobState::Failed;
        slot.job.last_error = Some(RunnerError::ToolFailure("cancelled".to_string()));
        let _ = slot
            .done
            .send(Some(Err(TransformError::Cancelled { key: key.clone() })));
        info!(%key, "cancelled unwatched transform job");
        true
    }

    /// Snapshot of one job's lifecycle state
    pub fn job(&self, key: &TransformKey) -> Option<TransformJob> {
        let jobs = self.inner.jobs.lock().expect("job table poisoned");
        jobs.get(key).map(|slot| slot.job.clone())
    }

    fn spawn_job(
        &self,
        key: TransformKey,
        request: TransformRequest,
        binding: RunnerBinding,
    ) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            execute_job(inner, key, request, binding).await;
        })
    }
}

async fn execute_job(
    inner: Arc<SchedulerInner>,
    key: TransformKey,
    request: TransformRequest,
    binding: RunnerBinding,
) {
    let spec = JobSpec::from_request(&request, inner.max_output_bytes);
    let attempt_timeout = Duration::from_secs(request.timeout_secs);

    set_state(&inner, &key, JobState::Running);

    loop {
        let attempt = bump_attempts(&inner, &key);
        debug!(%key, attempt, operation = %request.operation, "transform attempt");

        let result = match tokio::time::timeout(attempt_timeout, binding.runner.run(&spec)).await {
            Ok(result) => result,
            Err(_) => Err(RunnerError::Timeout),
        };

        // A success without full provenance is a runner contract violation.
        let result = result.and_then(|output| {
            if output.content_hash.is_none() || output.tool_version.is_none() {
                Err(RunnerError::ToolFailure(
                    "runner output missing content_hash or tool_version".to_string(),
                ))
            } else {
                Ok(output)
            }
        });

        match result {
            Ok(output) => {
                let representation = Representation {
                    media_type: output.media_type,
                    payload: output.payload,
                    width: output.width,
                    height: output.height,
                    duration_ms: None,
                    bytes: output.bytes,
                    content_hash: output.content_hash,
                    generated_by: output
                        .generated_by
                        .or_else(|| Some(request.operation.clone())),
                    tool_version: output.tool_version,
                    created_at: output.created_at.unwrap_or_else(Utc::now),
                };
                info!(%key, attempt, "transform succeeded");
                finish(&inner, &key, Ok(representation));
                return;
            }
            Err(error) => {
                let exhausted = attempt >= request.max_attempts;
                if exhausted || !error.is_retryable() {
                    warn!(%key, attempt, %error, "transform terminally failed");
                    finish_failed(&inner, &key, attempt, error);
                    return;
                }
                let backoff = inner.retry.backoff_for(attempt);
                debug!(%key, attempt, backoff_ms = backoff.as_millis() as u64, %error, "transform attempt failed, retrying");
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn set_state(inner: &SchedulerInner, key: &TransformKey, state: JobState) {
    let mut jobs = inner.jobs.lock().expect("job table poisoned");
    if let Some(slot) = jobs.get_mut(key) {
        slot.job.state = state;
    }
}

fn bump_attempts(inner: &SchedulerInner, key: &TransformKey) -> u32 {
    let mut jobs = inner.jobs.lock().expect("job table poisoned");
    match jobs.get_mut(key) {
        Some(slot) => {
            slot.job.attempts += 1;
            slot.job.attempts
        }
        None => 1,
    }
}

fn finish(inner: &SchedulerInner, key: &TransformKey, outcome: JobOutcome) {
    let mut jobs = inner.jobs.lock().expect("job table poisoned");
    if let Some(slot) = jobs.get_mut(key) {
        match &outcome {
            Ok(representation) => {
                slot.job.state = JobState::Succeeded;
                slot.job.result = Some(representation.clone());
                slot.job.last_error = None;
            }
            Err(_) => {
                slot.job.state = JobState::Failed;
            }
        }
        let _ = slot.done.send(Some(outcome));
    }
}

fn finish_failed(inner: &SchedulerInner, key: &TransformKey, attempts: u32, error: RunnerError) {
    let mut jobs = inner.jobs.lock().expect("job table poisoned");
    if let Some(slot) = jobs.get_mut(key) {
        slot.job.state = JobState::Failed;
        slot.job.last_error = Some(error.clone());
        let _ = slot.done.send(Some(Err(TransformError::Terminal {
            key: key.clone(),
            attempts,
            error,
        })));
    }
}
