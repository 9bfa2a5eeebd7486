//! Remote command execution over an authenticated session.
//!
//! - [`Connector`] / [`Connection`]: the seam between the session logic and
//!   the wire. [`SshConnector`] drives the system OpenSSH client; tests plug
//!   in a scripted fake.
//! - [`Session`]: owns at most one live connection, serializes commands on
//!   it and reconnects with bounded backoff when it drops.

pub mod session;
pub mod ssh;

use async_trait::async_trait;

use crate::config::ConnectionConfig;
use crate::error::{ConnectionError, TransportError};

pub use session::{Session, SessionState};
pub use ssh::SshConnector;

/// Exit status and captured streams of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn new(exit_code: i32, stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            exit_code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Opens connections to a remote host.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Connection;

    /// Establish an authenticated connection, giving up after the
    /// configured connect timeout.
    async fn connect(&self, config: &ConnectionConfig)
        -> Result<Self::Connection, ConnectionError>;
}

/// One live, authenticated connection.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Run `command` through the remote shell, optionally feeding `input`
    /// to its stdin, and wait for it to exit.
    async fn exec(
        &mut self,
        command: &str,
        input: Option<&[u8]>,
    ) -> Result<CommandOutput, TransportError>;

    /// Cheap local liveness check; never touches the network.
    fn is_alive(&mut self) -> bool;

    async fn close(&mut self);
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./=:,+@%".contains(&b))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_leaves_plain_words_alone() {
        assert_eq!(shell_quote("12345"), "12345");
        assert_eq!(shell_quote("slurm-%j.out"), "slurm-%j.out");
        assert_eq!(shell_quote("/scratch/alice/run_1"), "/scratch/alice/run_1");
    }

    #[test]
    fn quote_wraps_special_characters() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("my job"), "'my job'");
        assert_eq!(shell_quote("a;rm -rf ~"), "'a;rm -rf ~'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn command_output_text_helpers() {
        let out = CommandOutput::new(1, "hello\n", "  oops \n");
        assert!(!out.success());
        assert_eq!(out.stdout_text(), "hello\n");
        assert_eq!(out.stderr_text(), "oops");
    }
}
