//! Process supervisor: runs one job's subprocess from spawn to exit.
//!
//! For each job the supervisor claims the record (pending -> running),
//! spawns the wrapped binary, drains stdout and stderr on their own tasks,
//! and waits for whichever comes first of process exit, a cancel request,
//! or the stderr quiescence deadline. Every outcome becomes a terminal job
//! status; nothing is returned to the caller of [`Supervisor::run`].

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::invocation::Invocation;
use crate::job::{JobStatus, StreamKind};
use crate::normalize::{LineBuffer, LogNormalizer, extract_progress};
use crate::registry::Registry;

/// Forced-termination heuristic for a child that goes quiet.
///
/// The wrapped binary sometimes prints a final diagnostic on stderr and
/// then hangs instead of exiting. Once at least one stderr line has been
/// seen, every further line re-arms `idle_timeout`; when it elapses and the
/// process is still alive it is terminated. This is a bounded-wait
/// heuristic: a process that legitimately pauses stderr for longer than the
/// timeout is killed too.
#[derive(Debug, Clone)]
pub struct QuiescencePolicy {
    /// `None` disables the heuristic.
    pub idle_timeout: Option<Duration>,
    /// Let stdout lines re-arm the deadline as well.
    pub include_stdout: bool,
}

impl Default for QuiescencePolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Some(Duration::from_millis(500)),
            include_stdout: false,
        }
    }
}

/// Supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub quiescence: QuiescencePolicy,
    /// How long to wait for the pipe readers after the process exits.
    pub drain_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            quiescence: QuiescencePolicy::default(),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// How a supervised process ended, before it is mapped to a job status.
enum Exit {
    SpawnFailed(String),
    Exited {
        status: std::io::Result<ExitStatus>,
        stderr: Vec<String>,
    },
}

/// Runs jobs. Cheap to clone; clones share the set of active jobs.
#[derive(Clone)]
pub struct Supervisor {
    registry: Arc<Registry>,
    normalizer: Arc<LogNormalizer>,
    config: SupervisorConfig,
    /// Cancellation handles for jobs currently owned by this supervisor.
    active: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("active", &self.active_lock().len())
            .finish()
    }
}

impl Supervisor {
    pub fn new(
        registry: Arc<Registry>,
        normalizer: Arc<LogNormalizer>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry,
            normalizer,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn active_lock(&self) -> MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start `job_id` in the background.
    pub fn run(&self, job_id: Uuid, invocation: Invocation) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.execute(job_id, invocation).await })
    }

    /// Run `job_id` to completion on the current task.
    ///
    /// The job must be pending. If it is unknown, already running, or
    /// already cancelled, nothing is spawned.
    pub async fn execute(&self, job_id: Uuid, invocation: Invocation) {
        let cancel = CancellationToken::new();
        {
            let mut active = self.active_lock();
            if active.contains_key(&job_id) {
                warn!(job_id = %job_id, "job is already being supervised");
                return;
            }
            active.insert(job_id, cancel.clone());
        }

        if !self.registry.set_status(job_id, JobStatus::Running, None) {
            self.active_lock().remove(&job_id);
            warn!(job_id = %job_id, "job is not pending, abandoning run");
            return;
        }
        info!(job_id = %job_id, program = %invocation.program.display(), "job claimed");

        let exit = self.supervise(job_id, &invocation, &cancel).await;
        self.active_lock().remove(&job_id);
        self.report(job_id, &invocation, exit);
    }

    /// Request cancellation of a pending or running job.
    ///
    /// Marks the job cancelled, then signals the owning run (if any) to
    /// terminate the process. Returns `false` if the job is unknown or
    /// already finished.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        let applied = self.registry.set_status(
            job_id,
            JobStatus::Cancelled,
            Some(format!("Job {job_id} has been cancelled")),
        );
        if let Some(token) = self.active_lock().get(&job_id) {
            token.cancel();
        }
        if applied {
            info!(job_id = %job_id, "job cancelled");
        }
        applied
    }

    /// Cancel every job this supervisor is running.
    pub fn cancel_all(&self) -> usize {
        self.active_jobs()
            .into_iter()
            .filter(|id| self.cancel(*id))
            .count()
    }

    /// Ids of jobs currently owned by this supervisor.
    pub fn active_jobs(&self) -> Vec<Uuid> {
        self.active_lock().keys().copied().collect()
    }

    async fn supervise(
        &self,
        job_id: Uuid,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Exit {
        let label = self
            .registry
            .get(job_id)
            .and_then(|j| j.kind)
            .map(|k| k.to_string())
            .unwrap_or_else(|| "job".to_string());
        let sink = LineSink {
            job_id,
            registry: Arc::clone(&self.registry),
            normalizer: Arc::clone(&self.normalizer),
        };
        sink.record(
            StreamKind::Stdout,
            &format!("Starting {label}: {}", invocation.printable()),
        );

        if cancel.is_cancelled() {
            return Exit::SpawnFailed("cancelled before start".to_string());
        }

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let spawned = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn {} in {}",
                invocation.program.display(),
                invocation.working_dir.display()
            )
        });
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => return Exit::SpawnFailed(format!("{e:#}")),
        };
        info!(job_id = %job_id, pid = child.id(), "process spawned");

        let (activity_tx, mut activity_rx) = mpsc::unbounded_channel::<StreamKind>();
        let mut stdout_task = child.stdout.take().map(|out| {
            tokio::spawn(drain(out, StreamKind::Stdout, sink.clone(), activity_tx.clone()))
        });
        let mut stderr_task = child.stderr.take().map(|err| {
            tokio::spawn(drain(err, StreamKind::Stderr, sink.clone(), activity_tx.clone()))
        });
        drop(activity_tx);

        let policy = &self.config.quiescence;
        let mut seen_stderr = false;
        let mut deadline: Option<Instant> = None;
        let mut terminating = false;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = cancel.cancelled(), if !terminating => {
                    terminating = true;
                    info!(job_id = %job_id, "terminating cancelled job");
                    terminate(&mut child);
                }
                Some(stream) = activity_rx.recv() => {
                    seen_stderr |= stream == StreamKind::Stderr;
                    let rearm = stream == StreamKind::Stderr || policy.include_stdout;
                    if let Some(timeout) = policy.idle_timeout {
                        if seen_stderr && rearm {
                            deadline = Some(Instant::now() + timeout);
                        }
                    }
                }
                _ = idle_elapsed(deadline) => {
                    deadline = None;
                    if matches!(child.try_wait(), Ok(None)) && !terminating {
                        terminating = true;
                        warn!(job_id = %job_id, "stderr went quiet, terminating process");
                        terminate(&mut child);
                    }
                }
            }
        };
        info!(job_id = %job_id, status = ?status, "process exited");

        let drain_timeout = self.config.drain_timeout;
        if let Some(task) = stdout_task.as_mut() {
            join_drain(job_id, task, drain_timeout).await;
        }
        let stderr = match stderr_task.as_mut() {
            Some(task) => join_drain(job_id, task, drain_timeout).await,
            None => Vec::new(),
        };

        Exit::Exited { status, stderr }
    }

    fn report(&self, job_id: Uuid, invocation: &Invocation, exit: Exit) {
        if self
            .registry
            .get(job_id)
            .is_some_and(|j| j.status == JobStatus::Cancelled)
        {
            debug!(job_id = %job_id, "job was cancelled, not reporting exit");
            return;
        }

        let (status, result) = match exit {
            Exit::SpawnFailed(message) => {
                warn!(job_id = %job_id, error = %message, "spawn failed");
                (JobStatus::Failed, message)
            }
            Exit::Exited {
                status: Ok(status),
                ..
            } if status.success() => (JobStatus::Completed, invocation.outputs.join(",")),
            Exit::Exited {
                status: Ok(status),
                stderr,
            } => {
                let result = if stderr.is_empty() {
                    format!("process exited with {status}")
                } else {
                    stderr.join("\n")
                };
                (JobStatus::Failed, result)
            }
            Exit::Exited { status: Err(e), .. } => {
                (JobStatus::Failed, format!("failed to wait for process: {e}"))
            }
        };

        if self.registry.set_status(job_id, status, Some(result)) {
            info!(job_id = %job_id, status = %status, "job finished");
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Writes normalized child lines into the registry.
#[derive(Clone)]
struct LineSink {
    job_id: Uuid,
    registry: Arc<Registry>,
    normalizer: Arc<LogNormalizer>,
}

impl LineSink {
    /// Normalize `raw` and append each resulting line. Returns the lines
    /// actually recorded.
    fn record(&self, stream: StreamKind, raw: &str) -> Vec<String> {
        let lines = self.normalizer.normalize(raw);
        for line in &lines {
            debug!(target: "sdjobs::child", job_id = %self.job_id, stream = %stream, "{line}");
            let progress = extract_progress(line);
            self.registry
                .append_log(self.job_id, stream, line.clone(), progress);
        }
        lines
    }
}

/// Read one pipe to EOF, recording every line. Returns the recorded lines
/// for stderr (used as the failure result) and nothing for stdout.
async fn drain<R>(
    mut reader: R,
    stream: StreamKind,
    sink: LineSink,
    activity: mpsc::UnboundedSender<StreamKind>,
) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 8192];
    let mut lines = LineBuffer::new();
    let mut collected = Vec::new();

    let handle = |raw: String, collected: &mut Vec<String>| {
        if raw.trim().is_empty() {
            return;
        }
        let _ = activity.send(stream);
        let recorded = sink.record(stream, &raw);
        if stream == StreamKind::Stderr {
            collected.extend(recorded);
        }
    };

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for raw in lines.push(&buf[..n]) {
                    handle(raw, &mut collected);
                }
            }
            Err(e) => {
                warn!(job_id = %sink.job_id, stream = %stream, error = %e, "error reading child output");
                break;
            }
        }
    }
    if let Some(rest) = lines.finish() {
        handle(rest, &mut collected);
    }

    collected
}

async fn join_drain(
    job_id: Uuid,
    task: &mut JoinHandle<Vec<String>>,
    limit: Duration,
) -> Vec<String> {
    match tokio::time::timeout(limit, &mut *task).await {
        Ok(Ok(lines)) => lines,
        Ok(Err(e)) => {
            warn!(job_id = %job_id, error = %e, "output reader panicked");
            Vec::new()
        }
        Err(_elapsed) => {
            warn!(job_id = %job_id, "output pipe still open after exit, abandoning reader");
            task.abort();
            Vec::new()
        }
    }
}

async fn idle_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// SIGTERM immediately followed by SIGKILL.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: pid belongs to a child we spawned and have not reaped.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                debug!(pid, "SIGTERM failed");
            }
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "SIGKILL failed");
    }
}
