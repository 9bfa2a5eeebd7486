use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    /// The job script exited non-zero.
    NonZeroExit { code: i32 },
    /// Accounting reported a failure state (TIMEOUT, OUT_OF_MEMORY, ...)
    /// without a non-zero exit code.
    SchedulerReported { state: String },
    /// Too many consecutive polls failed.
    MonitoringLost,
    /// `await_terminal` ran out of time.
    Timeout,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::NonZeroExit { code } => write!(f, "exit code {}", code),
            FailureReason::SchedulerReported { state } => write!(f, "scheduler reported {}", state),
            FailureReason::MonitoringLost => write!(f, "monitoring lost"),
            FailureReason::Timeout => write!(f, "timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Submitted,
    Running,
    Completed,
    Failed(FailureReason),
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed(_) | JobState::Cancelled
        )
    }

    /// Position in the lifecycle; a job never moves to a lower rank.
    fn rank(&self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Submitted => 1,
            JobState::Running => 2,
            JobState::Completed | JobState::Failed(_) | JobState::Cancelled => 3,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Submitted => write!(f, "submitted"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed(reason) => write!(f, "failed ({})", reason),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What one poll observed, tagged with the poll's sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollResult {
    pub seq: u64,
    pub state: JobState,
    /// Raw scheduler wording behind `state`, kept for diagnostics.
    pub scheduler_state: String,
    pub exit_code: Option<i32>,
}

/// One submitted unit of work.
///
/// Only the job monitor mutates a `Job`; everyone else sees clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Local handle, assigned before submission.
    pub handle: Uuid,
    /// Scheduler-assigned id, set once `sbatch` succeeds.
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(skip)]
    pub script: String,
    pub state: JobState,
    pub scheduler_state: Option<String>,
    pub exit_code: Option<i32>,
    pub output_location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub terminal_at: Option<DateTime<Utc>>,
    /// Sequence number of the last poll applied.
    pub poll_seq: u64,
}

impl Job {
    pub fn new(script: String, name: Option<String>) -> Self {
        Self {
            handle: Uuid::new_v4(),
            id: None,
            name,
            script,
            state: JobState::Pending,
            scheduler_state: None,
            exit_code: None,
            output_location: None,
            created_at: Utc::now(),
            submitted_at: None,
            last_polled_at: None,
            terminal_at: None,
            poll_seq: 0,
        }
    }

    /// `Pending → Submitted`. Returns false if the job was already submitted.
    pub fn mark_submitted(
        &mut self,
        id: String,
        output_location: String,
        at: DateTime<Utc>,
    ) -> bool {
        if self.state != JobState::Pending {
            return false;
        }
        self.id = Some(id);
        self.output_location = Some(output_location);
        self.submitted_at = Some(at);
        self.state = JobState::Submitted;
        true
    }

    /// Apply a poll result.
    ///
    /// Stale polls (sequence not newer than the last applied one) are
    /// discarded, and an observed state never moves the job backwards:
    /// a `Running` job seeing `Queued` stays `Running`. Returns whether the
    /// state changed.
    pub fn apply_poll(&mut self, poll: &PollResult, at: DateTime<Utc>) -> bool {
        if poll.seq <= self.poll_seq || self.state == JobState::Pending {
            return false;
        }
        self.poll_seq = poll.seq;
        self.last_polled_at = Some(self.clamp(at));
        self.scheduler_state = Some(poll.scheduler_state.clone());

        if self.state.is_terminal() || poll.state.rank() <= self.state.rank() {
            return false;
        }
        if poll.state.is_terminal() {
            self.exit_code = poll.exit_code;
            self.finish(poll.state.clone(), at)
        } else {
            self.state = poll.state.clone();
            true
        }
    }

    /// Move a submitted or pending job into a terminal state.
    ///
    /// No-op on a job that is already terminal.
    pub fn finish(&mut self, state: JobState, at: DateTime<Utc>) -> bool {
        if self.state.is_terminal() || !state.is_terminal() {
            return false;
        }
        let at = self.clamp(at);
        self.state = state;
        self.terminal_at = Some(at);
        true
    }

    /// Keep `submitted_at ≤ last_polled_at ≤ terminal_at` even if the wall
    /// clock steps backwards.
    fn clamp(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        [self.submitted_at, self.last_polled_at]
            .into_iter()
            .flatten()
            .fold(at, |acc, t| acc.max(t))
    }
}
