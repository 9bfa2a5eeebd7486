use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::config::{ConnectionConfig, Credential};
use crate::error::{ConnectionError, TransportError};
use crate::transport::{CommandOutput, Connection, Connector};

/// OpenSSH reserves this exit status for its own failures.
const SSH_FAILURE_EXIT: i32 = 255;

/// Environment variable the askpass helper reads the password from.
const ASKPASS_SECRET_VAR: &str = "SLURM_PILOT_SSH_SECRET";

const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$SLURM_PILOT_SSH_SECRET\"\n";

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connects through the system `ssh` binary in ControlMaster mode.
///
/// `connect` starts one master process that authenticates and holds the
/// TCP connection; every command afterwards is multiplexed over the master's
/// control socket, so authentication happens once per session.
#[derive(Debug, Clone)]
pub struct SshConnector {
    program: PathBuf,
    extra_options: Vec<String>,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ssh"),
            extra_options: Vec::new(),
        }
    }
}

impl SshConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Extra `-o Key=Value` options passed to the master process.
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.extra_options.push(option.into());
        self
    }

    fn master_command(&self, config: &ConnectionConfig, control_path: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-M")
            .arg("-N")
            .arg("-S")
            .arg(control_path)
            .arg("-p")
            .arg(config.port().to_string())
            .arg("-o")
            .arg("ControlPersist=no")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                config.connect_timeout().as_secs().max(1)
            ))
            .arg("-o")
            .arg("ServerAliveInterval=15")
            .arg("-o")
            .arg("ServerAliveCountMax=3")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new");

        match config.credential() {
            Credential::Agent => {
                cmd.arg("-o").arg("BatchMode=yes");
            }
            Credential::IdentityFile(path) => {
                cmd.arg("-o")
                    .arg("BatchMode=yes")
                    .arg("-o")
                    .arg("IdentitiesOnly=yes")
                    .arg("-i")
                    .arg(path);
            }
            Credential::Password(_) => {
                cmd.arg("-o")
                    .arg("PreferredAuthentications=password,keyboard-interactive")
                    .arg("-o")
                    .arg("PubkeyAuthentication=no")
                    .arg("-o")
                    .arg("NumberOfPasswordPrompts=1");
            }
        }

        for option in &self.extra_options {
            cmd.arg("-o").arg(option);
        }

        cmd.arg(config.destination())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn control_ready(&self, control_path: &Path, destination: &str) -> bool {
        Command::new(&self.program)
            .arg("-S")
            .arg(control_path)
            .arg("-O")
            .arg("check")
            .arg(destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Connector for SshConnector {
    type Connection = SshConnection;

    async fn connect(&self, config: &ConnectionConfig) -> Result<SshConnection, ConnectionError> {
        let control_dir = tempfile::Builder::new()
            .prefix("slurm-pilot-")
            .tempdir()
            .map_err(ConnectionError::Launch)?;
        let control_path = control_dir.path().join("ctl");
        let destination = config.destination();

        let mut cmd = self.master_command(config, &control_path);
        if let Credential::Password(secret) = config.credential() {
            let helper = write_askpass_helper(control_dir.path()).map_err(ConnectionError::Launch)?;
            cmd.env("SSH_ASKPASS", helper)
                .env("SSH_ASKPASS_REQUIRE", "force")
                .env("DISPLAY", ":0")
                .env(ASKPASS_SECRET_VAR, secret.expose());
        }

        tracing::info!(
            host = config.host(),
            port = config.port(),
            user = config.username(),
            "Opening SSH session"
        );
        let mut master = cmd.spawn().map_err(ConnectionError::Launch)?;

        let timeout = config.connect_timeout() + Duration::from_secs(1);
        let ready = tokio::time::timeout(timeout, async {
            loop {
                match master.try_wait() {
                    Ok(Some(_)) => return false,
                    Ok(None) => {}
                    Err(_) => return false,
                }
                if self.control_ready(&control_path, &destination).await {
                    return true;
                }
                tokio::time::sleep(READY_POLL_INTERVAL).await;
            }
        })
        .await;

        match ready {
            Ok(true) => Ok(SshConnection {
                program: self.program.clone(),
                master,
                control_path,
                destination,
                _control_dir: control_dir,
            }),
            Ok(false) => {
                let detail = drain_stderr(&mut master).await;
                Err(classify_master_failure(config.host(), detail, config.connect_timeout()))
            }
            Err(_) => {
                let _ = master.kill().await;
                Err(ConnectionError::Timeout {
                    host: config.host().to_string(),
                    after: config.connect_timeout(),
                })
            }
        }
    }
}

/// A live ControlMaster session.
///
/// Dropping the value kills the master process and removes the control
/// socket directory, so the session is released on every exit path.
pub struct SshConnection {
    program: PathBuf,
    master: Child,
    control_path: PathBuf,
    destination: String,
    _control_dir: TempDir,
}

#[async_trait]
impl Connection for SshConnection {
    async fn exec(
        &mut self,
        command: &str,
        input: Option<&[u8]>,
    ) -> Result<CommandOutput, TransportError> {
        let mut child = Command::new(&self.program)
            .arg("-S")
            .arg(&self.control_path)
            .arg("-o")
            .arg("ControlMaster=no")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-T")
            .arg(&self.destination)
            .arg(command)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(bytes), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(bytes).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let master_alive = self.is_alive();
        match output.status.code() {
            // A remote command may exit 255 itself; only a dead master or
            // a client diagnostic means the channel is gone.
            Some(SSH_FAILURE_EXIT) if !master_alive || is_client_failure(&stderr) => {
                Err(TransportError::ChannelLost(stderr.trim().to_string()))
            }
            Some(code) => Ok(CommandOutput {
                exit_code: code,
                stdout: output.stdout,
                stderr: output.stderr,
            }),
            None => Err(TransportError::ChannelLost(
                "ssh client terminated by signal".to_string(),
            )),
        }
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.master.try_wait(), Ok(None))
    }

    async fn close(&mut self) {
        let _ = Command::new(&self.program)
            .arg("-S")
            .arg(&self.control_path)
            .arg("-O")
            .arg("exit")
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        if tokio::time::timeout(Duration::from_secs(2), self.master.wait())
            .await
            .is_err()
        {
            let _ = self.master.kill().await;
        }
    }
}

/// Whether `stderr` of a multiplexed `ssh` ends in a client-side error
/// rather than output of the remote command.
fn is_client_failure(stderr: &str) -> bool {
    let Some(last) = stderr.lines().map(str::trim).rev().find(|l| !l.is_empty()) else {
        return false;
    };
    last.starts_with("ssh:")
        || last.starts_with("mux_client")
        || last.starts_with("Control socket")
        || last.starts_with("client_loop:")
        || last.starts_with("packet_write_wait:")
        || (last.starts_with("Connection to ") && last.ends_with(" closed."))
        || last.contains("Connection reset by peer")
        || last.contains("Broken pipe")
}

fn write_askpass_helper(dir: &Path) -> std::io::Result<PathBuf> {
    let path = dir.join("askpass");
    std::fs::write(&path, ASKPASS_SCRIPT)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(path)
}

async fn drain_stderr(child: &mut Child) -> String {
    let mut buf = Vec::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

fn classify_master_failure(host: &str, detail: String, after: Duration) -> ConnectionError {
    let lowered = detail.to_ascii_lowercase();
    if lowered.contains("timed out") {
        ConnectionError::Timeout {
            host: host.to_string(),
            after,
        }
    } else if lowered.contains("permission denied")
        || lowered.contains("host key verification failed")
        || lowered.contains("too many authentication failures")
    {
        ConnectionError::Rejected {
            host: host.to_string(),
            detail,
        }
    } else {
        ConnectionError::Launch(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            if detail.is_empty() {
                "ssh master exited before the session was ready".to_string()
            } else {
                detail
            },
        ))
    }
}
