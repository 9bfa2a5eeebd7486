use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use zeroize::Zeroize;

/// A sensitive string (password, passphrase).
///
/// `Debug` and `Display` never print the value, and the backing buffer is
/// wiped when the secret is dropped. Use [`Secret::expose`] at the single
/// point where the value has to leave the process.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([REDACTED])")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// How the SSH client authenticates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Credential {
    /// Keys offered by the local ssh-agent or default identity files.
    #[default]
    Agent,
    /// A specific private key file.
    IdentityFile(PathBuf),
    /// Password (or keyboard-interactive) authentication.
    Password(Secret),
}

/// Everything needed to open one authenticated session to the login node.
///
/// Immutable once built: the session takes ownership and only hands out
/// shared references.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    host: String,
    port: u16,
    username: String,
    credential: Credential,
    connect_timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            credential: Credential::Agent,
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    pub fn with_password(self, password: Secret) -> Self {
        self.with_credential(Credential::Password(password))
    }

    pub fn with_identity_file(self, path: impl Into<PathBuf>) -> Self {
        self.with_credential(Credential::IdentityFile(path.into()))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// `user@host`, the form the ssh client expects.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Bounded exponential backoff used when a session has to be re-established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect attempts after the immediate one fails.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based): base, 2x base, 4x base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Whether concurrently monitored jobs share one SSH session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionMode {
    /// All jobs share one session; remote commands are serialized.
    #[default]
    Shared,
    /// Every submitted job gets its own session.
    PerJob,
}

/// Polling and retry knobs for the job monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    /// Consecutive failed polls tolerated before a job is declared lost.
    pub max_poll_failures: u32,
    /// Overall limit for `await_terminal`; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Reads of the output file before giving up on a file that is not there yet.
    pub fetch_attempts: u32,
    pub fetch_retry_delay: Duration,
    pub session_mode: SessionMode,
    pub reconnect: ReconnectPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            max_poll_failures: 3,
            timeout: None,
            fetch_attempts: 5,
            fetch_retry_delay: Duration::from_secs(2),
            session_mode: SessionMode::Shared,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl MonitorConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_session_mode(mut self, mode: SessionMode) -> Self {
        self.session_mode = mode;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// Per-submission `sbatch` options.
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    pub job_name: Option<String>,
    pub partition: Option<String>,
    /// Wall-clock limit in any format `sbatch --time` accepts.
    pub time_limit: Option<String>,
    /// Remote directory the script is uploaded to and submitted from.
    pub work_dir: String,
    /// Passed to `sbatch` verbatim (each one shell-quoted).
    pub extra_args: Vec<String>,
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self {
            job_name: None,
            partition: None,
            time_limit: None,
            work_dir: ".".to_string(),
            extra_args: Vec::new(),
        }
    }
}

impl SubmitOptions {
    pub fn with_job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<String>) -> Self {
        self.work_dir = dir.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret([REDACTED])");
        assert_eq!(secret.to_string(), "[REDACTED]");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn connection_config_debug_hides_password() {
        let cfg = ConnectionConfig::new("login.example.org", "alice")
            .with_password(Secret::new("hunter2"));
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn connection_config_defaults() {
        let cfg = ConnectionConfig::new("login.example.org", "alice");
        assert_eq!(cfg.port(), 22);
        assert_eq!(cfg.connect_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.credential(), &Credential::Agent);
        assert_eq!(cfg.destination(), "alice@login.example.org");
    }

    #[test]
    fn reconnect_policy_doubles_delay() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn reconnect_policy_caps_delay() {
        let policy = ReconnectPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn monitor_config_default() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_secs(10));
        assert_eq!(cfg.max_poll_failures, 3);
        assert!(cfg.timeout.is_none());
        assert_eq!(cfg.session_mode, SessionMode::Shared);
        assert_eq!(cfg.reconnect.max_attempts, 3);
    }

    #[test]
    fn submit_options_default_work_dir() {
        let opts = SubmitOptions::default();
        assert_eq!(opts.work_dir, ".");
        assert!(opts.job_name.is_none());
        assert!(opts.extra_args.is_empty());
    }
}
