use std::sync::Arc;

use uuid::Uuid;

use crate::config::SubmitOptions;
use crate::error::{
    CancelError, FetchError, FetchFailure, QueryError, SubmissionError, SubmissionFailure,
};
use crate::scheduler::parser::{self, Accounting, SchedulerState, DEFAULT_OUTPUT_PATTERN};
use crate::transport::{shell_quote, Connector, Session};

/// Exit status the fetch command uses for "file does not exist" (EX_NOINPUT).
const MISSING_FILE_EXIT: i32 = 66;

/// Speaks SLURM's command vocabulary over a shared [`Session`].
pub struct SchedulerClient<C: Connector> {
    session: Arc<Session<C>>,
}

impl<C: Connector> Clone for SchedulerClient<C> {
    fn clone(&self) -> Self {
        Self {
            session: self.session.clone(),
        }
    }
}

impl<C: Connector> SchedulerClient<C> {
    pub fn new(session: Arc<Session<C>>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<Session<C>> {
        &self.session
    }

    /// Upload `script` into the working directory and hand it to `sbatch`.
    ///
    /// Returns the scheduler-assigned job id and the uploaded file name.
    pub async fn submit(
        &self,
        script: &str,
        options: &SubmitOptions,
    ) -> Result<Submitted, SubmissionError> {
        let file_name = format!("job_{}.sh", Uuid::new_v4().simple());
        let script_path = remote_join(&options.work_dir, &file_name);

        let upload = format!(
            "mkdir -p {} && cat > {}",
            shell_quote(&options.work_dir),
            shell_quote(&script_path)
        );
        let out = self
            .session
            .execute_with_input(&upload, Some(script.as_bytes()))
            .await
            .map_err(|e| SubmissionError::new(SubmissionFailure::Transport, e.to_string()))?;
        if !out.success() {
            return Err(SubmissionError::new(
                SubmissionFailure::Upload,
                format!("writing {} exited {}: {}", script_path, out.exit_code, out.stderr_text()),
            ));
        }

        let command = sbatch_command(options, &file_name);
        let out = self
            .session
            .execute(&command)
            .await
            .map_err(|e| SubmissionError::new(SubmissionFailure::Transport, e.to_string()))?;

        let stdout = out.stdout_text();
        let stderr = out.stderr_text();
        match parser::parse_submit_output(&stdout) {
            Ok(job_id) if out.success() => {
                tracing::info!(job_id = %job_id, script = %script_path, "Job submitted");
                Ok(Submitted { job_id, file_name })
            }
            // The id is reported so the caller can clean the job up.
            Ok(job_id) => {
                tracing::warn!(
                    job_id = %job_id,
                    exit_code = out.exit_code,
                    stderr = %stderr,
                    "sbatch assigned an id but exited non-zero"
                );
                Err(SubmissionError::new(
                    SubmissionFailure::RemoteRejected,
                    format!(
                        "sbatch exited {} after assigning job {}: {}",
                        out.exit_code, job_id, stderr
                    ),
                ))
            }
            Err(_) if !out.success() && !stderr.is_empty() => {
                tracing::warn!(exit_code = out.exit_code, stderr = %stderr, "sbatch rejected job");
                Err(SubmissionError::new(SubmissionFailure::RemoteRejected, stderr))
            }
            Err(parse_err) => {
                tracing::warn!(exit_code = out.exit_code, error = %parse_err, "Unparseable sbatch output");
                Err(SubmissionError::new(
                    SubmissionFailure::ParseFailure,
                    parse_err.to_string(),
                ))
            }
        }
    }

    /// Current queue state of `job_id`.
    ///
    /// A job that has left the queue (empty listing, or a controller that no
    /// longer knows the id) is `Terminated`.
    pub async fn query_status(&self, job_id: &str) -> Result<SchedulerState, QueryError> {
        let command = format!("squeue -h -j {} -o %T", shell_quote(job_id));
        let out = self.session.execute(&command).await?;
        if !out.success() {
            let stderr = out.stderr_text();
            if parser::is_unknown_job_error(&stderr) {
                return Ok(SchedulerState::Terminated);
            }
            return Err(QueryError::RemoteFailed {
                command: "squeue",
                exit_code: out.exit_code,
                stderr,
            });
        }
        let state = parser::parse_queue_state(&out.stdout_text())?;
        tracing::debug!(job_id, state = %state, "Queried job state");
        Ok(state)
    }

    /// Final state and exit code from the accounting database.
    ///
    /// Fails with `AccountingPending` while no final record exists yet.
    pub async fn accounting(&self, job_id: &str) -> Result<Accounting, QueryError> {
        let command = format!(
            "sacct -n -P -X -j {} -o State,ExitCode",
            shell_quote(job_id)
        );
        let out = self.session.execute(&command).await?;
        if !out.success() {
            return Err(QueryError::RemoteFailed {
                command: "sacct",
                exit_code: out.exit_code,
                stderr: out.stderr_text(),
            });
        }
        let Some(acct) = parser::parse_accounting(&out.stdout_text())? else {
            return Err(QueryError::AccountingPending(job_id.to_string()));
        };
        if acct.outcome()?.is_none() {
            return Err(QueryError::AccountingPending(job_id.to_string()));
        }
        Ok(acct)
    }

    /// Where the job's stdout ends up.
    ///
    /// Asks the controller first; falls back to the script's `--output`
    /// directive and then to SLURM's default file name, resolved against
    /// the submission directory.
    pub async fn output_location(
        &self,
        job_id: &str,
        script: &str,
        options: &SubmitOptions,
        file_name: &str,
    ) -> String {
        let command = format!("scontrol show job -o {}", shell_quote(job_id));
        match self.session.execute(&command).await {
            Ok(out) if out.success() => {
                if let Some(path) = parser::parse_stdout_path(&out.stdout_text()) {
                    return path;
                }
            }
            Ok(out) => {
                tracing::debug!(job_id, exit_code = out.exit_code, "scontrol lookup failed")
            }
            Err(e) => tracing::debug!(job_id, error = %e, "scontrol lookup failed"),
        }

        let pattern = parser::directive_value(script, "--output", "-o")
            .unwrap_or_else(|| DEFAULT_OUTPUT_PATTERN.to_string());
        let job_name = options
            .job_name
            .clone()
            .or_else(|| parser::directive_value(script, "--job-name", "-J"))
            .unwrap_or_else(|| file_name.to_string());
        let expanded = parser::expand_output_pattern(
            &pattern,
            job_id,
            &job_name,
            self.session.config().username(),
        );
        remote_join(&options.work_dir, &expanded)
    }

    /// Read the output file at `location`.
    pub async fn fetch_output(&self, location: &str) -> Result<Vec<u8>, FetchError> {
        let quoted = shell_quote(location);
        let command = format!(
            "[ -f {q} ] || exit {code}; cat -- {q}",
            q = quoted,
            code = MISSING_FILE_EXIT
        );
        let out = self.session.execute(&command).await.map_err(|e| {
            FetchError::new(FetchFailure::Transport, location, e.to_string())
        })?;
        match out.exit_code {
            0 => Ok(out.stdout),
            MISSING_FILE_EXIT => Err(FetchError::new(
                FetchFailure::NotReady,
                location,
                "output file does not exist yet",
            )),
            code => Err(FetchError::new(
                FetchFailure::RemoteIo,
                location,
                format!("exit {}: {}", code, out.stderr_text()),
            )),
        }
    }

    /// `scancel` the job. Cancelling a job that already finished is a no-op.
    pub async fn cancel(&self, job_id: &str) -> Result<(), CancelError> {
        let command = format!("scancel {}", shell_quote(job_id));
        let out = self
            .session
            .execute(&command)
            .await
            .map_err(CancelError::Transport)?;
        if out.success() {
            tracing::info!(job_id, "Job cancelled");
            return Ok(());
        }
        let stderr = out.stderr_text();
        if parser::is_already_finished_error(&stderr) {
            tracing::debug!(job_id, "Cancel ignored, job already finished");
            return Ok(());
        }
        Err(CancelError::Rejected {
            job_id: job_id.to_string(),
            stderr,
        })
    }
}

/// Outcome of a successful `sbatch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub job_id: String,
    /// Name of the uploaded script inside the working directory.
    pub file_name: String,
}

fn sbatch_command(options: &SubmitOptions, file_name: &str) -> String {
    let mut args = vec!["sbatch".to_string()];
    if let Some(name) = &options.job_name {
        args.push(format!("--job-name={}", shell_quote(name)));
    }
    if let Some(partition) = &options.partition {
        args.push(format!("--partition={}", shell_quote(partition)));
    }
    if let Some(limit) = &options.time_limit {
        args.push(format!("--time={}", shell_quote(limit)));
    }
    args.extend(options.extra_args.iter().map(|a| shell_quote(a)));
    args.push(shell_quote(file_name));
    format!("cd {} && {}", shell_quote(&options.work_dir), args.join(" "))
}

/// Join a remote path onto the working directory; absolute paths win.
fn remote_join(dir: &str, path: &str) -> String {
    if path.starts_with('/') || dir.is_empty() || dir == "." {
        path.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbatch_command_quotes_options() {
        let opts = SubmitOptions {
            job_name: Some("my job".to_string()),
            partition: Some("gpu".to_string()),
            time_limit: Some("00:05:00".to_string()),
            work_dir: "runs".to_string(),
            extra_args: vec!["--mem=4G".to_string()],
        };
        assert_eq!(
            sbatch_command(&opts, "job_1.sh"),
            "cd runs && sbatch --job-name='my job' --partition=gpu --time=00:05:00 --mem=4G job_1.sh"
        );
    }

    #[test]
    fn remote_join_paths() {
        assert_eq!(remote_join(".", "slurm-1.out"), "slurm-1.out");
        assert_eq!(remote_join("runs/", "slurm-1.out"), "runs/slurm-1.out");
        assert_eq!(remote_join("runs", "/abs/x.out"), "/abs/x.out");
    }
}
