//! Command construction and result classification of `SchedulerClient`.


use std::sync::Arc;

use slurm_pilot::config::{ReconnectPolicy, SubmitOptions};
use slurm_pilot::error::{CancelError, FetchFailure, QueryError, SubmissionFailure};
use slurm_pilot::scheduler::{SchedulerClient, SchedulerState};
use slurm_pilot::transport::Session;
use test_harness::*;

fn client(cluster: &FakeCluster) -> SchedulerClient<FakeCluster> {
    let session = Session::new(
        Arc::new(cluster.clone()),
        Arc::new(test_connection()),
        ReconnectPolicy::default(),
    );
    SchedulerClient::new(Arc::new(session))
}

#[tokio::test]
async fn test_submit_uploads_script_then_runs_sbatch() {
    let cluster = FakeCluster::new();
    cluster.accept_submission("31337");
    let client = client(&cluster);
    let script = "#!/bin/bash\necho hello\n";
    let options = SubmitOptions::default()
        .with_work_dir("runs")
        .with_job_name("demo");

    let submitted = client.submit(script, &options).await.unwrap();
    assert_eq!(submitted.job_id, "31337");
    assert!(submitted.file_name.starts_with("job_"));
    assert!(submitted.file_name.ends_with(".sh"));

    let executed = cluster.executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[0].cmd, Cmd::Upload);
    assert_eq!(
        executed[0].command,
        format!("mkdir -p runs && cat > runs/{}", submitted.file_name)
    );
    assert_eq!(executed[0].input.as_deref(), Some(script.as_bytes()));
    assert_eq!(
        executed[1].command,
        format!("cd runs && sbatch --job-name=demo {}", submitted.file_name)
    );
}

#[tokio::test]
async fn test_submit_accepts_parsable_and_cluster_output() {
    for (stdout, expected) in [
        ("Submitted batch job 12 on cluster alpha\n", "12"),
        ("sbatch: warning: memory not set\nSubmitted batch job 13\n", "13"),
        ("14;alpha\n", "14"),
    ] {
        let cluster = FakeCluster::new();
        cluster.script(Cmd::Sbatch, vec![ok(stdout)]);
        let submitted = client(&cluster)
            .submit("true", &SubmitOptions::default())
            .await
            .unwrap();
        assert_eq!(submitted.job_id, expected);
    }
}

#[tokio::test]
async fn test_submit_rejects_nonzero_exit_even_with_id() {
    let cluster = FakeCluster::new();
    cluster.script(
        Cmd::Sbatch,
        vec![exit(1, "Submitted batch job 55\n", "sbatch: error: burst buffer plugin")],
    );
    let err = client(&cluster)
        .submit("true", &SubmitOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.reason, SubmissionFailure::RemoteRejected);
    assert!(err.detail.contains("job 55"), "{err}");
    assert!(err.detail.contains("burst buffer plugin"), "{err}");
}

#[tokio::test]
async fn test_submit_failure_classification() {
    let cases = [
        (exit(0, "queued somewhere\n", ""), SubmissionFailure::ParseFailure),
        (exit(1, "", ""), SubmissionFailure::ParseFailure),
        (
            exit(1, "", "sbatch: error: Batch job submission failed: Invalid account"),
            SubmissionFailure::RemoteRejected,
        ),
        (Reply::ChannelLost, SubmissionFailure::Transport),
    ];
    for (reply, expected) in cases {
        let cluster = FakeCluster::new();
        cluster.script(Cmd::Sbatch, vec![reply]);
        let err = client(&cluster)
            .submit("true", &SubmitOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.reason, expected, "{err}");
    }
}

#[tokio::test]
async fn test_upload_failure_stops_before_sbatch() {
    let cluster = FakeCluster::new();
    cluster.script(
        Cmd::Upload,
        vec![exit(1, "", "mkdir: cannot create directory 'runs': Permission denied")],
    );
    let err = client(&cluster)
        .submit("true", &SubmitOptions::default().with_work_dir("runs"))
        .await
        .unwrap_err();
    assert_eq!(err.reason, SubmissionFailure::Upload);
    assert_eq!(cluster.count(Cmd::Sbatch), 0);
}

#[tokio::test]
async fn test_query_status_states() {
    let cluster = FakeCluster::new();
    cluster.script(
        Cmd::Squeue,
        vec![
            ok("PENDING\n"),
            ok("R\n"),
            ok("COMPLETING\n"),
            ok(""),
            exit(1, "", "slurm_load_jobs error: Invalid job id specified"),
        ],
    );
    let client = client(&cluster);

    assert_eq!(client.query_status("1").await.unwrap(), SchedulerState::Queued);
    assert_eq!(client.query_status("1").await.unwrap(), SchedulerState::Running);
    assert_eq!(client.query_status("1").await.unwrap(), SchedulerState::Completing);
    assert_eq!(client.query_status("1").await.unwrap(), SchedulerState::Terminated);
    assert_eq!(client.query_status("1").await.unwrap(), SchedulerState::Terminated);
    assert_eq!(
        cluster.commands(Cmd::Squeue)[0],
        "squeue -h -j 1 -o %T".to_string()
    );
}

#[tokio::test]
async fn test_query_status_remote_failure_is_transient() {
    let cluster = FakeCluster::new();
    cluster.script(
        Cmd::Squeue,
        vec![exit(1, "", "slurm_load_jobs error: Socket timed out on send/recv operation")],
    );
    let err = client(&cluster).query_status("1").await.unwrap_err();
    assert!(matches!(err, QueryError::RemoteFailed { command: "squeue", .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_accounting_record() {
    let cluster = FakeCluster::new();
    cluster.script(Cmd::Sacct, vec![ok("OUT_OF_MEMORY|0:125\n")]);
    let acct = client(&cluster).accounting("8").await.unwrap();
    assert_eq!(acct.state, "OUT_OF_MEMORY");
    assert_eq!(acct.exit_code, 0);
    assert_eq!(acct.signal, 125);
    assert_eq!(
        cluster.commands(Cmd::Sacct),
        vec!["sacct -n -P -X -j 8 -o State,ExitCode".to_string()]
    );
}

#[tokio::test]
async fn test_accounting_without_final_record_is_pending() {
    let cluster = FakeCluster::new();
    cluster.script(Cmd::Sacct, vec![ok(""), ok("RUNNING|0:0\n"), ok("BOGUS|0:0\n")]);
    let client = client(&cluster);

    let err = client.accounting("8").await.unwrap_err();
    assert!(matches!(err, QueryError::AccountingPending(_)));
    let err = client.accounting("8").await.unwrap_err();
    assert!(matches!(err, QueryError::AccountingPending(_)));
    let err = client.accounting("8").await.unwrap_err();
    assert!(matches!(err, QueryError::Parse(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_output_location_prefers_controller() {
    let cluster = FakeCluster::new();
    cluster.script(
        Cmd::Scontrol,
        vec![ok("JobId=7 JobName=demo StdErr=/home/alice/7.err StdOut=/home/alice/7.log\n")],
    );
    let location = client(&cluster)
        .output_location("7", "#!/bin/bash\n#SBATCH -o other.out\n", &SubmitOptions::default(), "job_x.sh")
        .await;
    assert_eq!(location, "/home/alice/7.log");
}

#[tokio::test]
async fn test_output_location_falls_back_to_directive_and_default() {
    let cluster = FakeCluster::new();
    let client = client(&cluster);
    let options = SubmitOptions::default().with_work_dir("runs");

    let script = "#!/bin/bash\n#SBATCH --output=%u-%j.log\necho\n";
    assert_eq!(
        client.output_location("7", script, &options, "job_x.sh").await,
        "runs/alice-7.log"
    );
    assert_eq!(
        client.output_location("7", "echo\n", &options, "job_x.sh").await,
        "runs/slurm-7.out"
    );
}

#[tokio::test]
async fn test_fetch_output_classification() {
    let cluster = FakeCluster::new();
    cluster.script(
        Cmd::Fetch,
        vec![
            ok("line one\nline two\n"),
            exit(66, "", ""),
            exit(1, "", "cat: out: Input/output error"),
        ],
    );
    let client = client(&cluster);

    assert_eq!(
        client.fetch_output("my out.txt").await.unwrap(),
        b"line one\nline two\n"
    );
    assert_eq!(
        client.fetch_output("my out.txt").await.unwrap_err().reason,
        FetchFailure::NotReady
    );
    let err = client.fetch_output("my out.txt").await.unwrap_err();
    assert_eq!(err.reason, FetchFailure::RemoteIo);
    assert_eq!(err.location, "my out.txt");
    assert_eq!(
        cluster.commands(Cmd::Fetch)[0],
        "[ -f 'my out.txt' ] || exit 66; cat -- 'my out.txt'".to_string()
    );
}

#[tokio::test]
async fn test_cancel_finished_job_is_noop() {
    let cluster = FakeCluster::new();
    cluster.script(
        Cmd::Scancel,
        vec![
            exit(1, "", "scancel: error: Kill job error on job id 3: Job/step already completing or completed"),
            exit(1, "", "scancel: error: Invalid job id specified"),
            exit(1, "", "scancel: error: Kill job error on job id 3: Access/permission denied"),
        ],
    );
    let client = client(&cluster);

    client.cancel("3").await.unwrap();
    client.cancel("3").await.unwrap();
    let err = client.cancel("3").await.unwrap_err();
    assert!(matches!(err, CancelError::Rejected { .. }));
}
