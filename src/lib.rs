pub mod config;
pub mod error;
pub mod monitor;
pub mod scheduler;
pub mod shutdown;
pub mod transport;

pub use config::{ConnectionConfig, Credential, MonitorConfig, Secret, SessionMode, SubmitOptions};
pub use error::{Error, Result};
pub use monitor::{JobHandle, JobMonitor};
pub use scheduler::{FailureReason, Job, JobState};
pub use transport::SshConnector;
