// src/utils/executor.rs: where stage commands run
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use log::debug;
use tokio::process::Command;
use tokio::time::sleep;

use crate::config::defs::{SACCT_TAG, SBATCH_TAG, SQUEUE_TAG};

/// A shell-level unit of work: a bash pipeline plus a label for logs and job names.
#[derive(Debug, Clone)]
pub struct ShellJob {
    pub label: String,
    pub script: String,
}

impl ShellJob {
    pub fn new(label: impl Into<String>, script: impl Into<String>) -> Self {
        ShellJob { label: label.into(), script: script.into() }
    }

    /// The script as handed to bash, failing on the first broken pipe stage.
    pub fn wrapped(&self) -> String {
        format!("set -o pipefail\n{}", self.script)
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl JobOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Converts a non-zero exit into an error carrying the tail of stderr.
    pub fn check(self, label: &str) -> Result<JobOutput> {
        if self.success() {
            return Ok(self);
        }
        let tail: Vec<&str> = self.stderr.lines().rev().take(20).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        Err(anyhow!("{} exited with code {}:\n{}", label, self.exit_code, tail.join("\n")))
    }

    pub fn stdout_lines(&self) -> impl Iterator<Item = &str> {
        std::str::from_utf8(&self.stdout).unwrap_or("").lines()
    }
}

/// Runs shell jobs somewhere: on this host or through a cluster scheduler.
pub trait Executor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs the job to completion, collecting stdout, stderr and exit code.
    fn run<'a>(&'a self, job: &'a ShellJob) -> BoxFuture<'a, Result<JobOutput>>;
}

/// Runs each job as a local `bash -c` process.
#[derive(Debug, Default, Clone)]
pub struct LocalExecutor;

impl Executor for LocalExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    fn run<'a>(&'a self, job: &'a ShellJob) -> BoxFuture<'a, Result<JobOutput>> {
        Box::pin(async move {
            debug!("[{}] local job: {}", job.label, job.script);
            let output = Command::new("bash")
                .arg("-c")
                .arg(job.wrapped())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| anyhow!("Failed to spawn bash for {}: {}", job.label, e))?;
            Ok(JobOutput {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        })
    }
}

/// Submits each job with `sbatch --wrap` and polls the queue until it leaves.
pub struct SlurmExecutor {
    scratch_dir: PathBuf,
    delay: Duration,
    extra_args: Vec<String>,
    counter: AtomicU64,
}

impl SlurmExecutor {
    pub fn new(scratch_dir: PathBuf, delay: Duration, extra_args: Option<&str>) -> Self {
        let extra_args = extra_args
            .map(|a| a.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        SlurmExecutor { scratch_dir, delay, extra_args, counter: AtomicU64::new(0) }
    }

    async fn submit(&self, job: &ShellJob, out: &PathBuf, err: &PathBuf) -> Result<String> {
        let output = Command::new(SBATCH_TAG)
            .arg("--parsable")
            .arg(format!("--job-name={}", job.label))
            .arg(format!("--output={}", out.display()))
            .arg(format!("--error={}", err.display()))
            .args(&self.extra_args)
            .arg(format!("--wrap=bash -c {}", shell_quote(&job.wrapped())))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| anyhow!("Failed to spawn {}: {}", SBATCH_TAG, e))?;
        if !output.status.success() {
            return Err(anyhow!(
                "{} rejected {}: {}",
                SBATCH_TAG,
                job.label,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        parse_sbatch_job_id(&String::from_utf8_lossy(&output.stdout))
    }

    /// True while the queue lists the job. A failing squeue says nothing about the job.
    async fn still_queued(&self, job_id: &str) -> bool {
        match Command::new(SQUEUE_TAG).args(["-h", "-j", job_id]).output().await {
            Ok(output) => output.status.success() && !String::from_utf8_lossy(&output.stdout).trim().is_empty(),
            Err(e) => {
                debug!("{} failed for job {}: {}", SQUEUE_TAG, job_id, e);
                false
            }
        }
    }

    /// Exit code once accounting shows the job in a terminal state, None before that.
    async fn finished_exit_code(&self, job_id: &str) -> Result<Option<i32>> {
        let output = Command::new(SACCT_TAG)
            .args(["-n", "-P", "-X", "-o", "State,ExitCode", "-j", job_id])
            .output()
            .await
            .map_err(|e| anyhow!("Failed to spawn {}: {}", SACCT_TAG, e))?;
        if !output.status.success() {
            debug!("{} failed for job {}, polling again", SACCT_TAG, job_id);
            return Ok(None);
        }
        parse_sacct_record(&String::from_utf8_lossy(&output.stdout))
    }
}

impl Executor for SlurmExecutor {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn run<'a>(&'a self, job: &'a ShellJob) -> BoxFuture<'a, Result<JobOutput>> {
        Box::pin(async move {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            let out = self.scratch_dir.join(format!("{}.{}.out", job.label, n));
            let err = self.scratch_dir.join(format!("{}.{}.err", job.label, n));

            let job_id = self.submit(job, &out, &err).await?;
            debug!("[{}] submitted as slurm job {}", job.label, job_id);
            let exit_code = loop {
                if !self.still_queued(&job_id).await {
                    if let Some(code) = self.finished_exit_code(&job_id).await? {
                        break code;
                    }
                }
                sleep(self.delay).await;
            };

            let stdout = tokio::fs::read(&out).await.unwrap_or_default();
            let stderr = tokio::fs::read_to_string(&err).await.unwrap_or_default();
            let _ = tokio::fs::remove_file(&out).await;
            let _ = tokio::fs::remove_file(&err).await;
            Ok(JobOutput { exit_code, stdout, stderr })
        })
    }
}

/// Single-quotes `s` for bash.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

/// `sbatch --parsable` prints `<jobid>[;<cluster>]`.
fn parse_sbatch_job_id(stdout: &str) -> Result<String> {
    let id = stdout
        .trim()
        .split(';')
        .next()
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
        .with_context(|| format!("Unexpected sbatch output: '{}'", stdout.trim()))?;
    Ok(id.to_string())
}

const TERMINAL_STATES: &[&str] = &[
    "COMPLETED",
    "FAILED",
    "CANCELLED",
    "TIMEOUT",
    "OUT_OF_MEMORY",
    "NODE_FAIL",
    "PREEMPTED",
    "BOOT_FAIL",
    "DEADLINE",
];

/// `sacct -P -o State,ExitCode` prints `<state>|<code>:<signal>`.
/// None while the job is not in a terminal state or has no record yet.
/// A terminal state other than COMPLETED never yields 0.
fn parse_sacct_record(stdout: &str) -> Result<Option<i32>> {
    let Some(first) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return Ok(None);
    };
    let (state, exit) = first
        .split_once('|')
        .ok_or_else(|| anyhow!("Unexpected sacct record '{}'", first))?;
    // e.g. "CANCELLED by 1234"
    let state = state.split_whitespace().next().unwrap_or_default();
    if !TERMINAL_STATES.contains(&state) {
        return Ok(None);
    }
    let code = parse_exit_code(exit)?;
    Ok(Some(if state != "COMPLETED" && code == 0 { 1 } else { code }))
}

/// `<code>:<signal>`; a signal without a code maps to 128 + signal.
fn parse_exit_code(field: &str) -> Result<i32> {
    let field = field.trim();
    let (code, signal) = field.split_once(':').unwrap_or((field, "0"));
    let code: i32 = code.parse().with_context(|| format!("Invalid sacct exit code '{}'", field))?;
    let signal: i32 = signal.parse().unwrap_or(0);
    Ok(if code == 0 && signal != 0 { 128 + signal } else { code })
}
