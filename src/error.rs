use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::scheduler::job::Job;

/// The session could not be established or re-established.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection to {host} timed out after {after:?}")]
    Timeout { host: String, after: Duration },

    #[error("{host} refused the session: {detail}")]
    Rejected { host: String, detail: String },

    #[error("failed to launch ssh client: {0}")]
    Launch(#[source] std::io::Error),

    #[error("gave up on {host} after {attempts} reconnect attempts: {last}")]
    Exhausted {
        host: String,
        attempts: u32,
        last: Box<ConnectionError>,
    },

    #[error("session is closed")]
    Closed,
}

impl ConnectionError {
    /// Authentication failures and closed sessions will not heal by retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ConnectionError::Timeout { .. } | ConnectionError::Launch(_))
    }
}

/// A remote command could not be run to completion.
///
/// A command that ran and exited non-zero is *not* a transport error.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("channel lost while running command: {0}")]
    ChannelLost(String),

    #[error("i/o error on remote channel: {0}")]
    Io(#[from] std::io::Error),
}

/// Scheduler output that does not match the expected grammar.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no job id in sbatch output {0:?}")]
    MissingJobId(String),

    #[error("unexpected squeue output {0:?}")]
    MalformedQueueState(String),

    #[error("unexpected sacct output {0:?}")]
    MalformedAccounting(String),

    #[error("invalid exit code field {0:?}")]
    MalformedExitCode(String),

    #[error("unrecognized accounting state {0:?}")]
    UnknownAccountingState(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionFailure {
    /// `sbatch` output carried no job id.
    ParseFailure,
    /// `sbatch` exited non-zero with a diagnostic.
    RemoteRejected,
    /// The script could not be written on the remote side.
    Upload,
    /// The channel died mid-submission; whether the job exists is unknown.
    Transport,
}

impl fmt::Display for SubmissionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionFailure::ParseFailure => write!(f, "parse failure"),
            SubmissionFailure::RemoteRejected => write!(f, "rejected by scheduler"),
            SubmissionFailure::Upload => write!(f, "upload failed"),
            SubmissionFailure::Transport => write!(f, "transport failure"),
        }
    }
}

#[derive(Error, Debug)]
#[error("submission failed ({reason}): {detail}")]
pub struct SubmissionError {
    pub reason: SubmissionFailure,
    pub detail: String,
}

impl SubmissionError {
    pub fn new(reason: SubmissionFailure, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// A status or accounting query failed.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{command} exited with {exit_code}: {stderr}")]
    RemoteFailed {
        command: &'static str,
        exit_code: i32,
        stderr: String,
    },

    #[error("no final accounting record for job {0} yet")]
    AccountingPending(String),
}

impl QueryError {
    /// Parse failures are never retried: they would only repeat.
    pub fn is_transient(&self) -> bool {
        !matches!(self, QueryError::Parse(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchFailure {
    /// The job has not reached `Completed` or `Failed`.
    NotTerminal,
    /// The output file does not exist (yet).
    NotReady,
    /// The file exists but could not be read.
    RemoteIo,
    Transport,
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::NotTerminal => write!(f, "job not terminal"),
            FetchFailure::NotReady => write!(f, "output not ready"),
            FetchFailure::RemoteIo => write!(f, "remote i/o error"),
            FetchFailure::Transport => write!(f, "transport failure"),
        }
    }
}

#[derive(Error, Debug)]
#[error("fetching {location} failed ({reason}): {detail}")]
pub struct FetchError {
    pub reason: FetchFailure,
    pub location: String,
    pub detail: String,
}

impl FetchError {
    pub fn new(reason: FetchFailure, location: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            reason,
            location: location.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum CancelError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("scancel {job_id} failed: {stderr}")]
    Rejected { job_id: String, stderr: String },
}

/// `await_terminal` gave up. The job has been moved to `Failed(Timeout)`.
#[derive(Error, Debug)]
#[error("job {} not terminal after {after:?}", .job.id.as_deref().unwrap_or("<unsubmitted>"))]
pub struct TimeoutError {
    pub after: Duration,
    pub job: Box<Job>,
}

/// Which stage of the lifecycle an [`Error`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Submit,
    Poll,
    Fetch,
    Cancel,
    Timeout,
    Lookup,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Connect => write!(f, "connect"),
            Stage::Submit => write!(f, "submit"),
            Stage::Poll => write!(f, "poll"),
            Stage::Fetch => write!(f, "fetch"),
            Stage::Cancel => write!(f, "cancel"),
            Stage::Timeout => write!(f, "timeout"),
            Stage::Lookup => write!(f, "lookup"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("connect: {0}")]
    Connect(#[from] ConnectionError),

    #[error("submit: {0}")]
    Submit(#[from] SubmissionError),

    #[error("poll: {0}")]
    Poll(#[from] QueryError),

    #[error("fetch: {0}")]
    Fetch(#[from] FetchError),

    #[error("cancel: {0}")]
    Cancel(#[from] CancelError),

    #[error("{0}")]
    Timeout(#[from] TimeoutError),

    #[error("monitoring of job {} stopped while it was {}", .0.id.as_deref().unwrap_or("<unsubmitted>"), .0.state)]
    MonitoringStopped(Box<Job>),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("job registry is full ({0} jobs)")]
    RegistryFull(usize),
}

impl Error {
    pub fn stage(&self) -> Stage {
        match self {
            Error::Connect(_) => Stage::Connect,
            Error::Submit(_) | Error::RegistryFull(_) => Stage::Submit,
            Error::Poll(_) | Error::MonitoringStopped(_) => Stage::Poll,
            Error::Fetch(_) => Stage::Fetch,
            Error::Cancel(_) => Stage::Cancel,
            Error::Timeout(_) => Stage::Timeout,
            Error::JobNotFound(_) => Stage::Lookup,
        }
    }

    /// Whether repeating the failed operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connect(e) => e.is_transient(),
            Error::Submit(_) => false,
            Error::Poll(e) => e.is_transient(),
            Error::Fetch(e) => e.reason != FetchFailure::NotTerminal,
            Error::Cancel(_) => true,
            Error::Timeout(_) => false,
            Error::MonitoringStopped(_) => false,
            Error::JobNotFound(_) => false,
            Error::RegistryFull(_) => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
