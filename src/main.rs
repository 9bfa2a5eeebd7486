use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use slurm_pilot::config::{ConnectionConfig, MonitorConfig, ReconnectPolicy, Secret, SubmitOptions};
use slurm_pilot::error::Error;
use slurm_pilot::scheduler::{Job, SchedulerClient, SchedulerState};
use slurm_pilot::shutdown::install_shutdown_handler;
use slurm_pilot::transport::{Session, SshConnector};
use slurm_pilot::{JobMonitor, JobState};

/// Password for password authentication. Never accepted as a flag, so it
/// does not show up in the process list.
const PASSWORD_ENV: &str = "SLURM_PASSWORD";

#[derive(Parser, Debug)]
#[command(name = "slurm-pilot")]
#[command(version)]
#[command(about = "Submit and follow SLURM batch jobs over SSH")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    connection: ConnectionArgs,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Connection Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ConnectionArgs {
    /// Login node of the cluster
    #[arg(long, env = "SLURM_HOST")]
    host: String,

    /// SSH port
    #[arg(long, default_value = "22")]
    port: u16,

    /// Remote user name
    #[arg(long, short = 'u', env = "SLURM_USER")]
    user: String,

    /// Private key file (defaults to the ssh agent; set SLURM_PASSWORD for
    /// password authentication)
    #[arg(long, short = 'i')]
    identity: Option<PathBuf>,

    /// Seconds allowed for establishing the SSH connection
    #[arg(long, default_value = "10")]
    connect_timeout_secs: u64,

    /// Reconnect attempts after a dropped connection
    #[arg(long, default_value = "3")]
    reconnect_attempts: u32,
}

impl ConnectionArgs {
    fn to_config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(&self.host, &self.user)
            .with_port(self.port)
            .with_connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        if let Some(identity) = &self.identity {
            config = config.with_identity_file(identity.clone());
        } else if let Some(password) = std::env::var(PASSWORD_ENV).ok().filter(|p| !p.is_empty()) {
            config = config.with_password(Secret::new(password));
        }
        config
    }

    fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.reconnect_attempts,
            ..ReconnectPolicy::default()
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Submit a script, wait for it to finish and print its output
    Run {
        /// Path to the local batch script
        script: PathBuf,

        #[command(flatten)]
        submit: SubmitArgs,

        /// Seconds between status polls
        #[arg(long, default_value = "10")]
        poll_interval_secs: u64,

        /// Give up (and cancel the job) after this many seconds
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Submit a script and print the job id
    Submit {
        /// Path to the local batch script
        script: PathBuf,

        #[command(flatten)]
        submit: SubmitArgs,
    },
    /// Show the scheduler state of a job
    Status {
        /// SLURM job id
        job_id: String,
    },
    /// Cancel a job
    Cancel {
        /// SLURM job id
        job_id: String,
    },
    /// Print the output file of a job
    Output {
        /// SLURM job id
        job_id: String,

        /// Remote output path (otherwise asked from the controller)
        #[arg(long)]
        path: Option<String>,

        /// Remote directory the job was submitted from
        #[arg(long, default_value = ".")]
        work_dir: String,
    },
}

#[derive(Parser, Debug)]
struct SubmitArgs {
    /// Job name passed to sbatch
    #[arg(long)]
    job_name: Option<String>,

    /// Partition to submit to
    #[arg(long, short = 'p')]
    partition: Option<String>,

    /// Time limit in SLURM format (e.g. 00:30:00)
    #[arg(long, short = 't')]
    time: Option<String>,

    /// Remote directory the script is uploaded to and run from
    #[arg(long, default_value = ".")]
    work_dir: String,

    /// Extra arguments passed to sbatch verbatim
    #[arg(long = "sbatch-arg", allow_hyphen_values = true)]
    sbatch_args: Vec<String>,
}

impl SubmitArgs {
    fn to_options(&self) -> SubmitOptions {
        SubmitOptions {
            job_name: self.job_name.clone(),
            partition: self.partition.clone(),
            time_limit: self.time.clone(),
            work_dir: self.work_dir.clone(),
            extra_args: self.sbatch_args.clone(),
        }
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct SubmitOutput {
    job_id: String,
    output_location: Option<String>,
}

#[derive(Serialize)]
struct RunOutput {
    job: Job,
    output: Option<String>,
}

#[derive(Serialize)]
struct StatusOutput {
    job_id: String,
    scheduler_state: String,
    final_state: Option<String>,
    exit_code: Option<i32>,
}

#[derive(Serialize)]
struct CancelOutput {
    job_id: String,
    cancelled: bool,
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn read_script(path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("cannot read {}: {}", path.display(), e).into())
}

async fn handle_run(
    args: &Args,
    script: &Path,
    submit: &SubmitArgs,
    poll_interval: Duration,
    timeout: Option<Duration>,
) -> Result<(), Box<dyn std::error::Error>> {
    let script = read_script(script).await?;
    let mut config = MonitorConfig::default()
        .with_poll_interval(poll_interval)
        .with_reconnect(args.connection.reconnect_policy());
    if let Some(timeout) = timeout {
        config = config.with_timeout(timeout);
    }
    let monitor = Arc::new(JobMonitor::new(
        SshConnector::new(),
        args.connection.to_config(),
        config,
    ));

    let handle = monitor.submit_job(script, &submit.to_options()).await?;
    let shutdown = install_shutdown_handler();
    let mut waiter = monitor.spawn_monitor(handle.clone());

    let finished = tokio::select! {
        res = &mut waiter => Some(res),
        _ = shutdown.cancelled() => None,
    };
    let result = match finished {
        Some(res) => res?,
        None => {
            if let Err(e) = monitor.cancel(&handle).await {
                tracing::warn!(error = %e, "Could not cancel job on interrupt");
            }
            waiter.await?
        }
    };

    let job = match result {
        Ok(job) => job,
        Err(Error::Timeout(t)) => {
            monitor.shutdown().await;
            print_job(&t.job, None, &args.output)?;
            return Err(Error::Timeout(t).into());
        }
        Err(Error::MonitoringStopped(job)) => {
            monitor.shutdown().await;
            print_job(&job, None, &args.output)?;
            return Err(Error::MonitoringStopped(job).into());
        }
        Err(e) => {
            monitor.shutdown().await;
            return Err(e.into());
        }
    };

    let output = if job.state.is_terminal() && !matches!(job.state, JobState::Cancelled) {
        match monitor.retrieve_output(&handle).await {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(e) => {
                tracing::warn!(error = %e, "Could not fetch job output");
                None
            }
        }
    } else {
        None
    };
    monitor.shutdown().await;
    print_job(&job, output, &args.output)
}

fn print_job(
    job: &Job,
    output: Option<String>,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            let out = RunOutput {
                job: job.clone(),
                output,
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Table => {
            println!("Job ID:          {}", job.id.as_deref().unwrap_or("-"));
            println!("State:           {}", job.state);
            if let Some(code) = job.exit_code {
                println!("Exit Code:       {}", code);
            }
            if let Some(location) = &job.output_location {
                println!("Output File:     {}", location);
            }
            if let Some(output) = output {
                println!("Output:");
                for line in output.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

async fn handle_submit(
    args: &Args,
    script: &Path,
    submit: &SubmitArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let script = read_script(script).await?;
    let monitor = JobMonitor::new(
        SshConnector::new(),
        args.connection.to_config(),
        MonitorConfig::default().with_reconnect(args.connection.reconnect_policy()),
    );
    let result = monitor.submit_job(script, &submit.to_options()).await;
    monitor.shutdown().await;
    let job = result?.snapshot().await;
    let out = SubmitOutput {
        job_id: job.id.unwrap_or_default(),
        output_location: job.output_location,
    };

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&out)?),
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID:      {}", out.job_id);
            if let Some(location) = out.output_location {
                println!("Output File: {}", location);
            }
        }
    }
    Ok(())
}

async fn handle_status(
    client: &SchedulerClient<SshConnector>,
    job_id: String,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = client.query_status(&job_id).await?;
    let mut out = StatusOutput {
        job_id,
        scheduler_state: state.to_string(),
        final_state: None,
        exit_code: None,
    };
    if state == SchedulerState::Terminated {
        match client.accounting(&out.job_id).await {
            Ok(acct) => {
                out.final_state = Some(acct.state);
                out.exit_code = Some(acct.exit_code);
            }
            Err(e) => tracing::warn!(job_id = %out.job_id, error = %e, "No accounting record"),
        }
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&out)?),
        OutputFormat::Table => {
            println!("Job ID:          {}", out.job_id);
            println!("Scheduler State: {}", out.scheduler_state);
            if let Some(state) = &out.final_state {
                println!("Final State:     {}", state);
            }
            if let Some(code) = out.exit_code {
                println!("Exit Code:       {}", code);
            }
        }
    }
    Ok(())
}

async fn handle_cancel(
    client: &SchedulerClient<SshConnector>,
    job_id: String,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    client.cancel(&job_id).await?;
    let out = CancelOutput {
        job_id,
        cancelled: true,
    };
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&out)?),
        OutputFormat::Table => println!("Job {} cancelled.", out.job_id),
    }
    Ok(())
}

async fn handle_output(
    client: &SchedulerClient<SshConnector>,
    job_id: String,
    path: Option<String>,
    work_dir: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let location = match path {
        Some(path) => path,
        None => {
            let options = SubmitOptions::default().with_work_dir(work_dir);
            client.output_location(&job_id, "", &options, "").await
        }
    };
    let bytes = client.fetch_output(&location).await?;
    print!("{}", String::from_utf8_lossy(&bytes));
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    tracing::debug!(
        host = %args.connection.host,
        user = %args.connection.user,
        port = args.connection.port,
        "Starting slurm-pilot"
    );

    match &args.command {
        Commands::Run {
            script,
            submit,
            poll_interval_secs,
            timeout_secs,
        } => {
            handle_run(
                &args,
                script,
                submit,
                Duration::from_secs(*poll_interval_secs),
                timeout_secs.map(Duration::from_secs),
            )
            .await?;
        }
        Commands::Submit { script, submit } => {
            handle_submit(&args, script, submit).await?;
        }
        command => {
            let session = Arc::new(
                Session::connect(
                    Arc::new(SshConnector::new()),
                    Arc::new(args.connection.to_config()),
                    args.connection.reconnect_policy(),
                )
                .await?,
            );
            let client = SchedulerClient::new(session.clone());
            let result = match command {
                Commands::Status { job_id } => {
                    handle_status(&client, job_id.clone(), &args.output).await
                }
                Commands::Cancel { job_id } => {
                    handle_cancel(&client, job_id.clone(), &args.output).await
                }
                Commands::Output {
                    job_id,
                    path,
                    work_dir,
                } => handle_output(&client, job_id.clone(), path.clone(), work_dir.clone()).await,
                Commands::Run { .. } | Commands::Submit { .. } => Ok(()),
            };
            session.close().await;
            result?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_flag_is_not_accepted() {
        let parsed = Args::try_parse_from([
            "slurm-pilot", "--host", "h", "--user", "u", "--password", "x", "status", "1",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn identity_file_takes_the_place_of_a_password() {
        let args = Args::try_parse_from([
            "slurm-pilot", "--host", "h", "--user", "u", "-i", "/keys/id", "status", "1",
        ])
        .unwrap();
        assert_eq!(args.connection.identity, Some(PathBuf::from("/keys/id")));
        assert!(matches!(
            args.connection.to_config().credential(),
            slurm_pilot::config::Credential::IdentityFile(path) if path == Path::new("/keys/id")
        ));
    }
}
