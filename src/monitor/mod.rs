//! Job lifecycle driver.
//!
//! [`JobMonitor`] submits scripts, then polls each job until it reaches a
//! terminal state:
//!
//! 1. `submit_job` uploads the script, runs `sbatch` and records the job as
//!    `Submitted`. A failed submission never creates a job.
//! 2. `await_terminal` polls `squeue` at a fixed interval. Once the job
//!    leaves the queue, `sacct` supplies the final state and exit code.
//! 3. `retrieve_output` reads the job's output file, retrying briefly while
//!    the file is not visible yet.
//!
//! Consecutive transient poll failures beyond `max_poll_failures` move the
//! job to `Failed(MonitoringLost)`; an elapsed timeout moves it to
//! `Failed(Timeout)` and cancels it remotely.

pub mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ConnectionConfig, MonitorConfig, SessionMode, SubmitOptions};
use crate::error::{Error, FetchError, FetchFailure, QueryError, Result, TimeoutError};
use crate::scheduler::parser::{self, FinalOutcome};
use crate::scheduler::{FailureReason, Job, JobState, PollResult, SchedulerClient, SchedulerState};
use crate::transport::{Connector, Session};

pub use registry::JobRegistry;

struct Tracked<C: Connector> {
    id: Uuid,
    job: RwLock<Job>,
    client: SchedulerClient<C>,
    /// Cancelled when local monitoring of this job must stop.
    stop: CancellationToken,
    /// Held by whoever is polling, so one job has a single writer.
    driver: Mutex<()>,
    next_seq: AtomicU64,
}

/// Caller-side reference to a submitted job.
pub struct JobHandle<C: Connector> {
    inner: Arc<Tracked<C>>,
}

impl<C: Connector> Clone for JobHandle<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> std::fmt::Debug for JobHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").field("id", &self.inner.id).finish()
    }
}

impl<C: Connector> JobHandle<C> {
    fn new(job: Job, client: SchedulerClient<C>) -> Self {
        Self {
            inner: Arc::new(Tracked {
                id: job.handle,
                job: RwLock::new(job),
                client,
                stop: CancellationToken::new(),
                driver: Mutex::new(()),
                next_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Local handle id (not the scheduler job id).
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub async fn snapshot(&self) -> Job {
        self.inner.job.read().await.clone()
    }
}

/// Submits jobs and drives them to completion.
pub struct JobMonitor<C: Connector> {
    connector: Arc<C>,
    connection: Arc<ConnectionConfig>,
    config: MonitorConfig,
    shared: Arc<Session<C>>,
    registry: RwLock<JobRegistry<C>>,
}

impl<C: Connector> JobMonitor<C> {
    pub fn new(connector: C, connection: ConnectionConfig, config: MonitorConfig) -> Self {
        let connector = Arc::new(connector);
        let connection = Arc::new(connection);
        let shared = Arc::new(Session::new(
            connector.clone(),
            connection.clone(),
            config.reconnect.clone(),
        ));
        Self {
            connector,
            connection,
            config,
            shared,
            registry: RwLock::new(JobRegistry::new()),
        }
    }

    pub fn with_registry_capacity(mut self, max_jobs: usize) -> Self {
        self.registry = RwLock::new(JobRegistry::with_capacity(max_jobs));
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// The session shared by all jobs in [`SessionMode::Shared`].
    pub fn shared_session(&self) -> &Arc<Session<C>> {
        &self.shared
    }

    fn session_for_new_job(&self) -> Arc<Session<C>> {
        match self.config.session_mode {
            SessionMode::Shared => self.shared.clone(),
            SessionMode::PerJob => Arc::new(Session::new(
                self.connector.clone(),
                self.connection.clone(),
                self.config.reconnect.clone(),
            )),
        }
    }

    /// Submit `script` and start tracking it.
    ///
    /// On failure no job is tracked and nothing is retried.
    pub async fn submit_job(
        &self,
        script: impl Into<String>,
        options: &SubmitOptions,
    ) -> Result<JobHandle<C>> {
        {
            let registry = self.registry.read().await;
            if registry.is_full() {
                return Err(Error::RegistryFull(registry.capacity()));
            }
        }

        let session = self.session_for_new_job();
        session.ensure_connected().await?;
        let client = SchedulerClient::new(session);

        let script = script.into();
        let name = options
            .job_name
            .clone()
            .or_else(|| parser::directive_value(&script, "--job-name", "-J"));
        let mut job = Job::new(script, name);

        let submitted = client.submit(&job.script, options).await?;
        let location = client
            .output_location(&submitted.job_id, &job.script, options, &submitted.file_name)
            .await;
        tracing::info!(
            handle = %job.handle,
            job_id = %submitted.job_id,
            output = %location,
            "Tracking job"
        );
        job.mark_submitted(submitted.job_id, location, Utc::now());

        let handle = JobHandle::new(job, client);
        if !self.registry.write().await.add(handle.clone()) {
            tracing::warn!(handle = %handle.id(), "Job registry at capacity, job not indexed");
        }
        Ok(handle)
    }

    /// Look up a tracked job by its local handle id.
    pub async fn get(&self, handle_id: Uuid) -> Result<JobHandle<C>> {
        self.registry
            .read()
            .await
            .get(&handle_id)
            .cloned()
            .ok_or(Error::JobNotFound(handle_id))
    }

    /// Current snapshot of the job.
    pub async fn get_status(&self, handle: &JobHandle<C>) -> Job {
        handle.snapshot().await
    }

    /// Snapshots of every tracked job, oldest first.
    pub async fn jobs(&self) -> Vec<Job> {
        let handles = self.registry.read().await.handles();
        let mut jobs = Vec::with_capacity(handles.len());
        for handle in handles {
            jobs.push(handle.snapshot().await);
        }
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Stop tracking a job and return its final snapshot.
    pub async fn release(&self, handle: &JobHandle<C>) -> Option<Job> {
        let removed = self.registry.write().await.remove(&handle.id())?;
        removed.inner.stop.cancel();
        Some(removed.snapshot().await)
    }

    /// Poll with the configured interval and timeout.
    pub async fn wait(&self, handle: &JobHandle<C>) -> Result<Job> {
        self.await_terminal(handle, self.config.poll_interval, self.config.timeout)
            .await
    }

    /// Run [`JobMonitor::wait`] on its own task.
    pub fn spawn_monitor(self: &Arc<Self>, handle: JobHandle<C>) -> JoinHandle<Result<Job>> {
        let monitor = self.clone();
        tokio::spawn(async move { monitor.wait(&handle).await })
    }

    /// Poll until the job is terminal or `timeout` elapses.
    ///
    /// On timeout the job becomes `Failed(Timeout)`, a best-effort `scancel`
    /// is issued, and the snapshot is returned inside the error. The timeout
    /// also bounds the wait for another awaiter already driving the job.
    /// A poll result that cannot be parsed stops monitoring without touching
    /// the job state. If monitoring is stopped (release, or a cancel the
    /// scheduler refused) while the job is still live, the result is
    /// `Error::MonitoringStopped`.
    pub async fn await_terminal(
        &self,
        handle: &JobHandle<C>,
        poll_interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<Job> {
        let tracked = &handle.inner;
        let deadline = timeout.map(|t| Instant::now() + t);
        let after = timeout.unwrap_or_default();

        let _driver = tokio::select! {
            biased;
            guard = tracked.driver.lock() => guard,
            _ = tracked.stop.cancelled() => return self.stopped(handle).await,
            _ = wait_for(deadline) => return self.time_out(handle, after).await,
        };
        let mut failures = 0u32;

        loop {
            {
                let job = tracked.job.read().await;
                if job.state.is_terminal() {
                    return Ok(job.clone());
                }
            }
            if tracked.stop.is_cancelled() {
                return self.stopped(handle).await;
            }

            let seq = tracked.next_seq.fetch_add(1, Ordering::SeqCst);
            let outcome = tokio::select! {
                biased;
                _ = tracked.stop.cancelled() => return self.stopped(handle).await,
                _ = wait_for(deadline) => return self.time_out(handle, after).await,
                res = self.poll_once(tracked, seq) => res,
            };

            match outcome {
                Ok(poll) => {
                    failures = 0;
                    let mut job = tracked.job.write().await;
                    let before = job.state.clone();
                    if job.apply_poll(&poll, Utc::now()) {
                        tracing::info!(
                            job_id = job.id.as_deref().unwrap_or_default(),
                            from = %before,
                            to = %job.state,
                            scheduler_state = %poll.scheduler_state,
                            "Job state changed"
                        );
                    }
                    if job.state.is_terminal() {
                        return Ok(job.clone());
                    }
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    let mut job = tracked.job.write().await;
                    tracing::warn!(
                        job_id = job.id.as_deref().unwrap_or_default(),
                        failures,
                        max_failures = self.config.max_poll_failures,
                        error = %e,
                        "Poll failed"
                    );
                    if failures >= self.config.max_poll_failures {
                        job.finish(JobState::Failed(FailureReason::MonitoringLost), Utc::now());
                        tracing::error!(
                            job_id = job.id.as_deref().unwrap_or_default(),
                            "Monitoring lost, giving up on job"
                        );
                        return Ok(job.clone());
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Unexpected scheduler output, stopping monitoring");
                    return Err(Error::Poll(e));
                }
            }

            tokio::select! {
                biased;
                _ = tracked.stop.cancelled() => return self.stopped(handle).await,
                _ = wait_for(deadline) => return self.time_out(handle, after).await,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Read the job's output file.
    ///
    /// Only allowed once the job is `Completed` or `Failed`. Never changes
    /// the job state; a failure can be retried on its own.
    pub async fn retrieve_output(
        &self,
        handle: &JobHandle<C>,
    ) -> std::result::Result<Vec<u8>, FetchError> {
        let job = handle.snapshot().await;
        let location = job.output_location.clone().unwrap_or_default();
        if !matches!(job.state, JobState::Completed | JobState::Failed(_)) {
            return Err(FetchError::new(
                FetchFailure::NotTerminal,
                location,
                format!("job is {}", job.state),
            ));
        }

        let attempts = self.config.fetch_attempts.max(1);
        let mut attempt = 1;
        loop {
            match handle.inner.client.fetch_output(&location).await {
                Ok(bytes) => {
                    tracing::info!(
                        job_id = job.id.as_deref().unwrap_or_default(),
                        bytes = bytes.len(),
                        "Fetched job output"
                    );
                    return Ok(bytes);
                }
                Err(e) if e.reason == FetchFailure::NotReady && attempt < attempts => {
                    tracing::debug!(location = %location, attempt, "Output not visible yet");
                    attempt += 1;
                    tokio::time::sleep(self.config.fetch_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Cancel the job.
    ///
    /// Local polling stops whatever happens remotely. The job becomes
    /// `Cancelled` only if `scancel` succeeds; cancelling a terminal job is
    /// a no-op.
    pub async fn cancel(&self, handle: &JobHandle<C>) -> Result<()> {
        let tracked = &handle.inner;
        let (job_id, terminal) = {
            let job = tracked.job.read().await;
            (job.id.clone(), job.state.is_terminal())
        };
        if terminal {
            tracing::debug!(handle = %handle.id(), "Cancel on terminal job ignored");
            return Ok(());
        }

        let Some(job_id) = job_id else {
            tracked.stop.cancel();
            return Ok(());
        };
        // The job is marked before `stop` fires so awaiters see the final state.
        let result = match tracked.client.cancel(&job_id).await {
            Ok(()) => {
                let mut job = tracked.job.write().await;
                if job.finish(JobState::Cancelled, Utc::now()) {
                    tracing::info!(job_id = %job_id, "Job cancelled");
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Remote cancel failed");
                Err(Error::Cancel(e))
            }
        };
        tracked.stop.cancel();
        result
    }

    /// Stop all monitoring and release every session.
    pub async fn shutdown(&self) {
        let handles = self.registry.read().await.handles();
        for handle in &handles {
            handle.inner.stop.cancel();
            handle.inner.client.session().close().await;
        }
        self.shared.close().await;
        tracing::info!(jobs = handles.len(), "Monitor shut down");
    }

    async fn poll_once(
        &self,
        tracked: &Tracked<C>,
        seq: u64,
    ) -> std::result::Result<PollResult, QueryError> {
        let job_id = tracked.job.read().await.id.clone().unwrap_or_default();
        let state = tracked.client.query_status(&job_id).await?;

        let (next, scheduler_state, exit_code) = match state {
            SchedulerState::Queued => (JobState::Submitted, state.to_string(), None),
            SchedulerState::Running | SchedulerState::Completing => {
                (JobState::Running, state.to_string(), None)
            }
            SchedulerState::Unknown(ref raw) => {
                tracing::warn!(job_id = %job_id, state = %raw, "Unrecognized queue state, keeping current state");
                (JobState::Submitted, state.to_string(), None)
            }
            SchedulerState::Terminated => {
                let acct = tracked.client.accounting(&job_id).await?;
                let next = match acct.outcome()? {
                    Some(FinalOutcome::Completed) if acct.exit_code == 0 => JobState::Completed,
                    Some(FinalOutcome::Cancelled) => JobState::Cancelled,
                    Some(FinalOutcome::Failed) if acct.exit_code == 0 => {
                        JobState::Failed(FailureReason::SchedulerReported {
                            state: acct.state.clone(),
                        })
                    }
                    Some(_) => JobState::Failed(FailureReason::NonZeroExit {
                        code: acct.exit_code,
                    }),
                    None => return Err(QueryError::AccountingPending(job_id)),
                };
                (next, acct.state.clone(), Some(acct.exit_code))
            }
        };

        Ok(PollResult {
            seq,
            state: next,
            scheduler_state,
            exit_code,
        })
    }

    async fn stopped(&self, handle: &JobHandle<C>) -> Result<Job> {
        let job = handle.snapshot().await;
        if job.state.is_terminal() {
            return Ok(job);
        }
        tracing::debug!(handle = %handle.id(), state = %job.state, "Monitoring stopped");
        Err(Error::MonitoringStopped(Box::new(job)))
    }

    /// Give up on a job whose deadline passed. A job that finished in the
    /// meantime is returned as is.
    async fn time_out(&self, handle: &JobHandle<C>, after: Duration) -> Result<Job> {
        let tracked = &handle.inner;
        let job_id = {
            let job = tracked.job.read().await;
            if job.state.is_terminal() {
                return Ok(job.clone());
            }
            job.id.clone()
        };
        tracing::warn!(
            job_id = job_id.as_deref().unwrap_or_default(),
            after_secs = after.as_secs(),
            "Job did not finish in time, cancelling"
        );
        if let Some(job_id) = &job_id {
            if let Err(e) = tracked.client.cancel(job_id).await {
                tracing::warn!(job_id = %job_id, error = %e, "Best-effort cancel after timeout failed");
            }
        }
        let mut job = tracked.job.write().await;
        if !job.finish(JobState::Failed(FailureReason::Timeout), Utc::now()) {
            return Ok(job.clone());
        }
        Err(Error::Timeout(TimeoutError {
            after,
            job: Box::new(job.clone()),
        }))
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
