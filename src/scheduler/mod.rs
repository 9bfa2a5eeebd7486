pub mod client;
pub mod job;
pub mod parser;

pub use client::{SchedulerClient, Submitted};
pub use job::{FailureReason, Job, JobState, PollResult};
pub use parser::{Accounting, FinalOutcome, SchedulerState};
