//! Parsers for SLURM command output.
//!
//! Every function here is pure and total: output that does not match the
//! expected grammar becomes a [`ParseError`], never a guessed state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Default `sbatch` output file pattern when the script names none.
pub const DEFAULT_OUTPUT_PATTERN: &str = "slurm-%j.out";

/// A job's queue state as reported by `squeue`, normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    Queued,
    Running,
    Completing,
    /// No longer in the active queue.
    Terminated,
    /// A well-formed state word this crate does not know.
    Unknown(String),
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Queued => write!(f, "queued"),
            SchedulerState::Running => write!(f, "running"),
            SchedulerState::Completing => write!(f, "completing"),
            SchedulerState::Terminated => write!(f, "terminated"),
            SchedulerState::Unknown(raw) => write!(f, "unknown({})", raw),
        }
    }
}

/// How a finished job ended according to accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalOutcome {
    Completed,
    Failed,
    Cancelled,
}

/// One `sacct` allocation record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accounting {
    /// First word of the State column (`CANCELLED by 1000` → `CANCELLED`).
    pub state: String,
    pub exit_code: i32,
    pub signal: i32,
}

impl Accounting {
    /// `None` while the record still describes a live job.
    pub fn outcome(&self) -> Result<Option<FinalOutcome>, ParseError> {
        match self.state.as_str() {
            "COMPLETED" => Ok(Some(FinalOutcome::Completed)),
            "CANCELLED" => Ok(Some(FinalOutcome::Cancelled)),
            "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE"
            | "PREEMPTED" | "REVOKED" | "SPECIAL_EXIT" => Ok(Some(FinalOutcome::Failed)),
            "PENDING" | "RUNNING" | "REQUEUED" | "RESIZING" | "SUSPENDED" | "COMPLETING" => {
                Ok(None)
            }
            other => Err(ParseError::UnknownAccountingState(other.to_string())),
        }
    }
}

/// Extract the job id from `sbatch` stdout.
///
/// Accepts the human form (`Submitted batch job 123`, optionally followed by
/// `on cluster <name>`) and the `--parsable` form (`123` or `123;cluster`).
/// Warnings printed before the id line are skipped.
pub fn parse_submit_output(stdout: &str) -> Result<String, ParseError> {
    for line in stdout.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("Submitted batch job ") {
            if let Some(id) = rest.split_whitespace().next().filter(|t| is_job_id(t)) {
                return Ok(id.to_string());
            }
            continue;
        }
        let candidate = line.split(';').next().unwrap_or_default();
        if is_job_id(candidate) {
            return Ok(candidate.to_string());
        }
    }
    Err(ParseError::MissingJobId(stdout.trim().to_string()))
}

/// Parse `squeue -h -j <id> -o %T` (or `%t`) output.
///
/// An empty listing means the job has left the queue. Several lines with the
/// same state are tolerated; conflicting lines are not.
pub fn parse_queue_state(stdout: &str) -> Result<SchedulerState, ParseError> {
    let mut seen: Option<&str> = None;
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if line.split_whitespace().count() != 1 || !is_state_word(line) {
            return Err(ParseError::MalformedQueueState(stdout.trim().to_string()));
        }
        match seen {
            Some(prev) if prev != line => {
                return Err(ParseError::MalformedQueueState(stdout.trim().to_string()))
            }
            _ => seen = Some(line),
        }
    }
    Ok(match seen {
        None => SchedulerState::Terminated,
        Some(word) => normalize_state(word),
    })
}

/// Map a long (`RUNNING`) or compact (`R`) squeue state to a normalized state.
pub fn normalize_state(word: &str) -> SchedulerState {
    match word.to_ascii_uppercase().as_str() {
        "PENDING" | "PD" | "CONFIGURING" | "CF" | "REQUEUED" | "RQ" | "REQUEUE_HOLD" | "RH"
        | "REQUEUE_FED" | "RF" | "RESV_DEL_HOLD" | "RD" | "SUSPENDED" | "S" | "STOPPED"
        | "ST" | "RESIZING" | "RS" => SchedulerState::Queued,
        "RUNNING" | "R" | "SIGNALING" | "SI" | "STAGE_OUT" | "SO" => SchedulerState::Running,
        "COMPLETING" | "CG" => SchedulerState::Completing,
        "COMPLETED" | "CD" | "FAILED" | "F" | "CANCELLED" | "CA" | "TIMEOUT" | "TO"
        | "NODE_FAIL" | "NF" | "PREEMPTED" | "PR" | "OUT_OF_MEMORY" | "OOM" | "BOOT_FAIL"
        | "BF" | "DEADLINE" | "DL" | "SPECIAL_EXIT" | "SE" | "REVOKED" | "RV" => {
            SchedulerState::Terminated
        }
        _ => SchedulerState::Unknown(word.to_string()),
    }
}

/// Parse `sacct -n -P -X -o State,ExitCode` output.
///
/// Returns `None` when accounting has no record yet.
pub fn parse_accounting(stdout: &str) -> Result<Option<Accounting>, ParseError> {
    let line = match stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
        Some(line) => line,
        None => return Ok(None),
    };
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() != 2 {
        return Err(ParseError::MalformedAccounting(stdout.trim().to_string()));
    }
    let state = fields[0]
        .split_whitespace()
        .next()
        .filter(|w| is_state_word(w))
        .ok_or_else(|| ParseError::MalformedAccounting(stdout.trim().to_string()))?;
    let (exit_code, signal) = parse_exit_field(fields[1])?;
    Ok(Some(Accounting {
        state: state.to_ascii_uppercase(),
        exit_code,
        signal,
    }))
}

/// `sacct` reports exit status as `<code>:<signal>`.
fn parse_exit_field(field: &str) -> Result<(i32, i32), ParseError> {
    let malformed = || ParseError::MalformedExitCode(field.to_string());
    let (code, signal) = field.trim().split_once(':').ok_or_else(malformed)?;
    let code = code.parse::<i32>().map_err(|_| malformed())?;
    let signal = signal.parse::<i32>().map_err(|_| malformed())?;
    Ok((code, signal))
}

/// `squeue`/`scancel` say this once the controller has purged the job.
pub fn is_unknown_job_error(stderr: &str) -> bool {
    stderr.contains("Invalid job id specified")
}

/// `scancel` on a job that already finished.
pub fn is_already_finished_error(stderr: &str) -> bool {
    is_unknown_job_error(stderr)
        || stderr.contains("already completing or completed")
        || stderr.contains("Job/step already completing")
}

/// `StdOut=` field of `scontrol show job -o <id>`.
pub fn parse_stdout_path(scontrol: &str) -> Option<String> {
    scontrol
        .split_whitespace()
        .find_map(|token| token.strip_prefix("StdOut="))
        .filter(|path| !path.is_empty() && *path != "(null)")
        .map(str::to_string)
}

/// Value of an `#SBATCH` directive given by long (`--output`) or short
/// (`-o`) name.
///
/// `sbatch` stops reading directives at the first command line, and so does
/// this.
pub fn directive_value(script: &str, long: &str, short: &str) -> Option<String> {
    let mut found = None;
    for line in script.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if !line.starts_with('#') {
            break;
        }
        let Some(rest) = line.strip_prefix("#SBATCH") else {
            continue;
        };
        let mut tokens = rest.split_whitespace();
        while let Some(token) = tokens.next() {
            if let Some(value) = token.strip_prefix(long).and_then(|r| r.strip_prefix('=')) {
                found = Some(value.to_string());
            } else if token == long || token == short {
                if let Some(value) = tokens.next() {
                    found = Some(value.to_string());
                }
            } else if let Some(value) = token.strip_prefix(short).filter(|v| !v.is_empty()) {
                if !token.starts_with("--") {
                    found = Some(value.to_string());
                }
            }
        }
    }
    found.map(|v| v.trim_matches(|c| c == '"' || c == '\'').to_string())
}

/// Expand the `sbatch` filename pattern placeholders this crate can resolve
/// locally: `%j` (and `%A`), `%x`, `%u` and `%%`.
pub fn expand_output_pattern(pattern: &str, job_id: &str, job_name: &str, user: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + job_id.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('j') | Some('A') => out.push_str(job_id),
            Some('x') => out.push_str(job_name),
            Some('u') => out.push_str(user),
            Some('%') => out.push('%'),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

fn is_job_id(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

fn is_state_word(word: &str) -> bool {
    !word.is_empty() && word.bytes().all(|b| b.is_ascii_alphabetic() || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;

    // sbatch output as printed by several SLURM releases.
    const SBATCH_PLAIN: &str = "Submitted batch job 12345\n";
    const SBATCH_MULTI_CLUSTER: &str = "Submitted batch job 778 on cluster gpu\n";
    const SBATCH_PARSABLE: &str = "4242\n";
    const SBATCH_PARSABLE_CLUSTER: &str = "4242;gpu\n";
    const SBATCH_WITH_WARNING: &str =
        "sbatch: warning: can't honor --ntasks-per-node set to 4\nSubmitted batch job 9\n";

    #[test]
    fn submit_output_fixtures() {
        assert_eq!(parse_submit_output(SBATCH_PLAIN).unwrap(), "12345");
        assert_eq!(parse_submit_output(SBATCH_MULTI_CLUSTER).unwrap(), "778");
        assert_eq!(parse_submit_output(SBATCH_PARSABLE).unwrap(), "4242");
        assert_eq!(parse_submit_output(SBATCH_PARSABLE_CLUSTER).unwrap(), "4242");
        assert_eq!(parse_submit_output(SBATCH_WITH_WARNING).unwrap(), "9");
    }

    #[test]
    fn submit_output_without_id_is_an_error() {
        assert_eq!(
            parse_submit_output("").unwrap_err(),
            ParseError::MissingJobId(String::new())
        );
        assert!(parse_submit_output("Submitted batch job\n").is_err());
        assert!(parse_submit_output("Submitted batch job abc\n").is_err());
        assert!(parse_submit_output("sbatch: error: Batch job submission failed\n").is_err());
    }

    #[test]
    fn queue_state_long_words() {
        assert_eq!(parse_queue_state("PENDING\n").unwrap(), SchedulerState::Queued);
        assert_eq!(parse_queue_state("RUNNING\n").unwrap(), SchedulerState::Running);
        assert_eq!(
            parse_queue_state("COMPLETING\n").unwrap(),
            SchedulerState::Completing
        );
        assert_eq!(
            parse_queue_state("COMPLETED\n").unwrap(),
            SchedulerState::Terminated
        );
        assert_eq!(parse_queue_state("CONFIGURING").unwrap(), SchedulerState::Queued);
    }

    #[test]
    fn queue_state_compact_codes() {
        assert_eq!(parse_queue_state("PD\n").unwrap(), SchedulerState::Queued);
        assert_eq!(parse_queue_state("R\n").unwrap(), SchedulerState::Running);
        assert_eq!(parse_queue_state("CG\n").unwrap(), SchedulerState::Completing);
        assert_eq!(parse_queue_state("CA\n").unwrap(), SchedulerState::Terminated);
    }

    #[test]
    fn empty_listing_is_terminated() {
        assert_eq!(parse_queue_state("").unwrap(), SchedulerState::Terminated);
        assert_eq!(parse_queue_state("\n  \n").unwrap(), SchedulerState::Terminated);
    }

    #[test]
    fn empty_listing_stays_terminated() {
        for _ in 0..5 {
            assert_eq!(parse_queue_state("").unwrap(), SchedulerState::Terminated);
        }
    }

    #[test]
    fn unknown_word_is_not_guessed() {
        assert_eq!(
            parse_queue_state("POWER_UP_NODE\n").unwrap(),
            SchedulerState::Unknown("POWER_UP_NODE".to_string())
        );
    }

    #[test]
    fn garbage_queue_output_is_an_error() {
        assert!(parse_queue_state("JOBID PARTITION NAME\n").is_err());
        assert!(parse_queue_state("slurm_load_jobs error: timeout\n").is_err());
        assert!(parse_queue_state("RUNNING\nPENDING\n").is_err());
        assert!(parse_queue_state("12345\n").is_err());
    }

    #[test]
    fn repeated_identical_lines_are_accepted() {
        assert_eq!(
            parse_queue_state("RUNNING\nRUNNING\n").unwrap(),
            SchedulerState::Running
        );
    }

    #[test]
    fn accounting_fixtures() {
        let acct = parse_accounting("COMPLETED|0:0\n").unwrap().unwrap();
        assert_eq!(acct.state, "COMPLETED");
        assert_eq!(acct.exit_code, 0);
        assert_eq!(acct.outcome().unwrap(), Some(FinalOutcome::Completed));

        let acct = parse_accounting("FAILED|2:0\n").unwrap().unwrap();
        assert_eq!(acct.exit_code, 2);
        assert_eq!(acct.outcome().unwrap(), Some(FinalOutcome::Failed));

        let acct = parse_accounting("CANCELLED by 1000|0:15\n").unwrap().unwrap();
        assert_eq!(acct.state, "CANCELLED");
        assert_eq!(acct.signal, 15);
        assert_eq!(acct.outcome().unwrap(), Some(FinalOutcome::Cancelled));

        let acct = parse_accounting("TIMEOUT|0:0\n").unwrap().unwrap();
        assert_eq!(acct.outcome().unwrap(), Some(FinalOutcome::Failed));
    }

    #[test]
    fn accounting_for_live_job_is_not_final() {
        let acct = parse_accounting("RUNNING|0:0\n").unwrap().unwrap();
        assert_eq!(acct.outcome().unwrap(), None);
    }

    #[test]
    fn accounting_empty_is_none() {
        assert_eq!(parse_accounting("").unwrap(), None);
    }

    #[test]
    fn accounting_malformed() {
        assert!(matches!(
            parse_accounting("COMPLETED 0:0\n"),
            Err(ParseError::MalformedAccounting(_))
        ));
        assert!(matches!(
            parse_accounting("COMPLETED|zero\n"),
            Err(ParseError::MalformedExitCode(_))
        ));
        let acct = parse_accounting("WEIRD_STATE|0:0\n").unwrap().unwrap();
        assert!(matches!(
            acct.outcome(),
            Err(ParseError::UnknownAccountingState(_))
        ));
    }

    #[test]
    fn scancel_finished_job_messages() {
        assert!(is_already_finished_error(
            "scancel: error: Kill job error on job id 12345: Job/step already completing or completed"
        ));
        assert!(is_already_finished_error(
            "scancel: error: Kill job error on job id 12345: Invalid job id specified"
        ));
        assert!(!is_already_finished_error(
            "scancel: error: Kill job error on job id 12345: Access/permission denied"
        ));
    }

    #[test]
    fn scontrol_stdout_path() {
        let out = "JobId=12345 JobName=test_add UserId=alice(1000) WorkDir=/home/alice \
                   StdErr=/home/alice/slurm-12345.out StdIn=/dev/null StdOut=/home/alice/slurm-12345.out";
        assert_eq!(
            parse_stdout_path(out).as_deref(),
            Some("/home/alice/slurm-12345.out")
        );
        assert_eq!(parse_stdout_path("JobId=1 StdOut=(null)"), None);
        assert_eq!(parse_stdout_path("slurm_load_jobs error"), None);
    }

    #[test]
    fn output_directive_forms() {
        let script = "#!/bin/bash\n#SBATCH --job-name=test_add\n#SBATCH --output=logs/run-%j.out\n#SBATCH --time=00:01:00\n\necho hi\n";
        assert_eq!(
            directive_value(script, "--output", "-o").as_deref(),
            Some("logs/run-%j.out")
        );
        assert_eq!(
            directive_value(script, "--job-name", "-J").as_deref(),
            Some("test_add")
        );

        let short = "#!/bin/sh\n#SBATCH -o out_%j.txt -J quick\n";
        assert_eq!(
            directive_value(short, "--output", "-o").as_deref(),
            Some("out_%j.txt")
        );
        assert_eq!(directive_value(short, "--job-name", "-J").as_deref(), Some("quick"));
    }

    #[test]
    fn directives_after_first_command_are_ignored() {
        let script = "#!/bin/bash\necho start\n#SBATCH --output=late.out\n";
        assert_eq!(directive_value(script, "--output", "-o"), None);
    }

    #[test]
    fn expand_pattern_placeholders() {
        assert_eq!(
            expand_output_pattern(DEFAULT_OUTPUT_PATTERN, "12345", "job", "alice"),
            "slurm-12345.out"
        );
        assert_eq!(
            expand_output_pattern("/scratch/%u/%x-%j.log", "7", "train", "alice"),
            "/scratch/alice/train-7.log"
        );
        assert_eq!(expand_output_pattern("100%%-%N.out", "7", "x", "u"), "100%-%N.out");
    }
}
