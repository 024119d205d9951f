//! In-process cluster: a set of named hosts that run jobs on this machine
//! through a [`JobRunner`].
//!
//! Each host keeps the output of every job it started so log attaches can
//! replay history, and holds pending attaches for jobs that have not been
//! submitted yet. Jobs that exit stay known to the host for log retrieval
//! but are no longer reported by `list_hosts`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::process::ChildStdin;
use tokio::sync::{broadcast, oneshot, RwLock};
use tokio_util::sync::CancellationToken;

use crate::cluster::runner::JobRunner;
use crate::cluster::{
    AddJobsRequest, AttachFlags, AttachReady, AttachRequest, AttachSession, ClusterClient,
    ClusterError, HostClient, HostState, JobSpec,
};
use crate::demux::{self, StreamKind};

const ATTACH_BUFFER: usize = 64 * 1024;
const LIVE_BACKLOG: usize = 1024;
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
enum LogEvent {
    Chunk(StreamKind, Bytes),
    Exit,
}

#[derive(Default)]
struct LogState {
    chunks: Vec<(StreamKind, Bytes)>,
    closed: bool,
}

/// Everything a job wrote, plus a live feed of what it writes next.
struct OutputLog {
    state: Mutex<LogState>,
    live: broadcast::Sender<LogEvent>,
}

impl OutputLog {
    fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_BACKLOG);
        Self {
            state: Mutex::new(LogState::default()),
            live,
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, kind: StreamKind, chunk: Bytes) {
        let mut state = self.lock();
        state.chunks.push((kind, chunk.clone()));
        let _ = self.live.send(LogEvent::Chunk(kind, chunk));
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        let _ = self.live.send(LogEvent::Exit);
    }

    /// History so far and, unless the job already exited, a receiver for
    /// everything after it. Taken under one lock so nothing falls between.
    fn subscribe(&self) -> (Vec<(StreamKind, Bytes)>, Option<broadcast::Receiver<LogEvent>>) {
        let state = self.lock();
        let live = (!state.closed).then(|| self.live.subscribe());
        (state.chunks.clone(), live)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Starting,
    Running,
    Exited(Option<i32>),
}

struct LocalJob {
    spec: JobSpec,
    state: JobState,
    output: Arc<OutputLog>,
    stop: CancellationToken,
    started_at: DateTime<Utc>,
}

struct PendingAttach {
    req: AttachRequest,
    io: DuplexStream,
    ready: oneshot::Sender<Result<(), String>>,
}

#[derive(Default)]
struct HostTable {
    jobs: HashMap<String, LocalJob>,
    pending: HashMap<String, Vec<PendingAttach>>,
}

struct LocalHost {
    id: String,
    runner: Arc<dyn JobRunner>,
    table: Mutex<HostTable>,
}

impl LocalHost {
    fn new(id: String, runner: Arc<dyn JobRunner>) -> Self {
        Self {
            id,
            runner,
            table: Mutex::new(HostTable::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> HostState {
        let table = self.lock();
        let mut jobs: Vec<JobSpec> = table
            .jobs
            .values()
            .filter(|job| !matches!(job.state, JobState::Exited(_)))
            .map(|job| job.spec.clone())
            .collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        HostState {
            id: self.id.clone(),
            jobs,
        }
    }

    async fn start(self: &Arc<Self>, mut spec: JobSpec) -> Result<(), ClusterError> {
        let output = Arc::new(OutputLog::new());
        let stop = CancellationToken::new();
        {
            let mut table = self.lock();
            if table.jobs.contains_key(&spec.id) {
                return Err(ClusterError::Unavailable(format!(
                    "job {} already exists on host {}",
                    spec.id, self.id
                )));
            }

            // Terminal size from an interactive attach made before submission.
            if spec.config.tty {
                let geometry = table.pending.get(&spec.id).and_then(|attaches| {
                    attaches
                        .iter()
                        .find(|a| a.req.flags.contains(AttachFlags::STDIN))
                        .filter(|a| a.req.height > 0 && a.req.width > 0)
                        .map(|a| (a.req.height, a.req.width))
                });
                if let Some((lines, columns)) = geometry {
                    spec.config.env.push(format!("LINES={}", lines));
                    spec.config.env.push(format!("COLUMNS={}", columns));
                }
            }

            table.jobs.insert(
                spec.id.clone(),
                LocalJob {
                    spec: spec.clone(),
                    state: JobState::Starting,
                    output: Arc::clone(&output),
                    stop: stop.clone(),
                    started_at: Utc::now(),
                },
            );
        }

        let mut child = match self.runner.spawn(&spec).await {
            Ok(child) => child,
            Err(e) => {
                let pending = {
                    let mut table = self.lock();
                    table.jobs.remove(&spec.id);
                    table.pending.remove(&spec.id).unwrap_or_default()
                };
                for attach in pending {
                    let _ = attach.ready.send(Err(format!("job failed to start: {}", e)));
                }
                tracing::warn!(host_id = %self.id, job_id = %spec.id, error = %e, "Job failed to start");
                return Err(ClusterError::Unavailable(format!(
                    "failed to start job {}: {}",
                    spec.id, e
                )));
            }
        };

        let pending = {
            let mut table = self.lock();
            if let Some(job) = table.jobs.get_mut(&spec.id) {
                job.state = JobState::Running;
            }
            table.pending.remove(&spec.id).unwrap_or_default()
        };

        let tty = spec.config.tty;
        let mut stdin = child.stdin.take();
        for attach in pending {
            let (reader, writer) = tokio::io::split(attach.io);
            tokio::spawn(serve_output(Arc::clone(&output), writer, attach.req.flags, tty));
            if attach.req.flags.contains(AttachFlags::STDIN) {
                match stdin.take() {
                    Some(stdin) => {
                        tokio::spawn(forward_stdin(spec.id.clone(), reader, stdin));
                    }
                    None => tracing::debug!(job_id = %spec.id, "Job has no stdin to attach"),
                }
            }
            let _ = attach.ready.send(Ok(()));
        }
        // Without an interactive attach, nobody will ever write to stdin.
        drop(stdin);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tracing::info!(host_id = %self.id, job_id = %spec.id, "Job started");

        let host = Arc::clone(self);
        tokio::spawn(async move {
            let exit = async {
                let exited = tokio::select! {
                    status = child.wait() => Some(status),
                    _ = stop.cancelled() => None,
                };
                match exited {
                    Some(status) => status,
                    None => {
                        if let Err(e) = host.runner.stop(&spec, &mut child).await {
                            tracing::warn!(job_id = %spec.id, error = %e, "Failed to stop job");
                        }
                        child.wait().await
                    }
                }
            };
            let (status, _, _) = tokio::join!(
                exit,
                capture(StreamKind::Stdout, stdout, Arc::clone(&output)),
                capture(StreamKind::Stderr, stderr, Arc::clone(&output)),
            );
            output.close();

            let exit_code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(job_id = %spec.id, error = %e, "Failed to wait for job");
                    None
                }
            };

            let mut table = host.lock();
            if let Some(job) = table.jobs.get_mut(&spec.id) {
                job.state = JobState::Exited(exit_code);
                tracing::info!(
                    host_id = %host.id,
                    job_id = %spec.id,
                    exit_code = ?exit_code,
                    runtime_ms = (Utc::now() - job.started_at).num_milliseconds(),
                    "Job exited"
                );
            }
        });

        Ok(())
    }

    fn attach(&self, req: AttachRequest, wait: bool) -> Result<AttachSession, ClusterError> {
        let mut table = self.lock();
        let state = table.jobs.get(&req.job_id).map(|job| job.state);

        match state {
            Some(JobState::Running) | Some(JobState::Exited(_)) => {
                let job = &table.jobs[&req.job_id];
                if req.flags.contains(AttachFlags::STDIN) {
                    tracing::debug!(job_id = %req.job_id, "Ignoring stdin for a job that already started");
                }
                let (client, host_end) = tokio::io::duplex(ATTACH_BUFFER);
                tokio::spawn(serve_output(
                    Arc::clone(&job.output),
                    host_end,
                    req.flags,
                    job.spec.config.tty,
                ));
                Ok(AttachSession::new(Box::new(client)).with_tty(job.spec.config.tty))
            }
            Some(JobState::Starting) if !wait => Err(ClusterError::AttachWouldWait),
            None if !wait => Err(ClusterError::JobNotFound(req.job_id)),
            _ => {
                let tty = table
                    .jobs
                    .get(&req.job_id)
                    .is_some_and(|job| job.spec.config.tty);
                let (client, host_end) = tokio::io::duplex(ATTACH_BUFFER);
                let (ready_tx, ready) = AttachReady::channel();
                tracing::debug!(host_id = %self.id, job_id = %req.job_id, "Attach registered before job start");
                table
                    .pending
                    .entry(req.job_id.clone())
                    .or_default()
                    .push(PendingAttach {
                        req,
                        io: host_end,
                        ready: ready_tx,
                    });
                Ok(AttachSession::pending(Box::new(client), ready).with_tty(tty))
            }
        }
    }

    fn detach(&self, job_id: &str) {
        let removed = self.lock().pending.remove(job_id).unwrap_or_default();
        if !removed.is_empty() {
            tracing::debug!(host_id = %self.id, job_id, count = removed.len(), "Pending attaches dropped");
        }
    }

    fn stop(&self, job_id: &str) -> Result<(), ClusterError> {
        let table = self.lock();
        let job = table
            .jobs
            .get(job_id)
            .ok_or_else(|| ClusterError::JobNotFound(job_id.to_string()))?;
        if !matches!(job.state, JobState::Exited(_)) {
            tracing::info!(host_id = %self.id, job_id, "Stopping job");
            job.stop.cancel();
        }
        Ok(())
    }
}

/// Read one of the job's output pipes into its log until end of input.
async fn capture<R>(kind: StreamKind, reader: Option<R>, output: Arc<OutputLog>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => output.push(kind, Bytes::copy_from_slice(&buf[..n])),
            Err(e) => {
                tracing::debug!(stream = kind.name(), error = %e, "Output read failed");
                break;
            }
        }
    }
}

/// Copy an attach client's input into the job until the client half-closes.
async fn forward_stdin<R>(job_id: String, mut reader: R, mut stdin: ChildStdin)
where
    R: AsyncRead + Unpin,
{
    match tokio::io::copy(&mut reader, &mut stdin).await {
        Ok(bytes) => tracing::debug!(job_id = %job_id, bytes, "Attach stdin closed"),
        Err(e) => tracing::debug!(job_id = %job_id, error = %e, "Attach stdin failed"),
    }
    // Dropping stdin closes the pipe so the job sees end of input.
}

fn wants(flags: AttachFlags, kind: StreamKind) -> bool {
    match kind {
        StreamKind::Stdout => flags.contains(AttachFlags::STDOUT),
        StreamKind::Stderr => flags.contains(AttachFlags::STDERR),
    }
}

async fn write_chunk<W>(writer: &mut W, kind: StreamKind, chunk: &[u8], tty: bool) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if tty {
        writer.write_all(chunk).await
    } else {
        demux::write_frame(writer, kind, chunk).await
    }
}

/// Feed a job's output to one attach according to its flags, then
/// half-close the attach.
async fn serve_output<W>(output: Arc<OutputLog>, mut writer: W, flags: AttachFlags, tty: bool)
where
    W: AsyncWrite + Unpin,
{
    let (history, live) = output.subscribe();

    let result: std::io::Result<()> = async {
        if flags.contains(AttachFlags::LOGS) {
            for (kind, chunk) in history.iter().filter(|(kind, _)| wants(flags, *kind)) {
                write_chunk(&mut writer, *kind, chunk, tty).await?;
            }
        }

        if let (true, Some(mut live)) = (flags.contains(AttachFlags::STREAM), live) {
            loop {
                match live.recv().await {
                    Ok(LogEvent::Chunk(kind, chunk)) if wants(flags, kind) => {
                        write_chunk(&mut writer, kind, &chunk, tty).await?;
                    }
                    Ok(LogEvent::Chunk(..)) => {}
                    Ok(LogEvent::Exit) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Attach fell behind job output");
                    }
                }
            }
        }
        writer.flush().await
    }
    .await;

    if let Err(e) = result {
        tracing::debug!(error = %e, "Attach output ended early");
    }
    let _ = writer.shutdown().await;
}

/// Cluster of in-process hosts sharing one [`JobRunner`].
pub struct LocalCluster {
    hosts: RwLock<HashMap<String, Arc<LocalHost>>>,
    runner: Arc<dyn JobRunner>,
}

impl LocalCluster {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            runner,
        }
    }

    pub async fn with_hosts<I, S>(runner: Arc<dyn JobRunner>, host_ids: I) -> Result<Self, ClusterError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let cluster = Self::new(runner);
        for id in host_ids {
            cluster.add_host(id.as_ref()).await?;
        }
        Ok(cluster)
    }

    pub async fn add_host(&self, host_id: &str) -> Result<(), ClusterError> {
        if host_id.is_empty() || host_id.contains('-') {
            return Err(ClusterError::Unavailable(format!(
                "invalid host ID {:?}: must be non-empty and contain no '-'",
                host_id
            )));
        }
        let mut hosts = self.hosts.write().await;
        if hosts.contains_key(host_id) {
            return Err(ClusterError::Unavailable(format!(
                "host {} already registered",
                host_id
            )));
        }
        hosts.insert(
            host_id.to_string(),
            Arc::new(LocalHost::new(host_id.to_string(), Arc::clone(&self.runner))),
        );
        tracing::info!(host_id, "Host registered");
        Ok(())
    }

    async fn host(&self, host_id: &str) -> Result<Arc<LocalHost>, ClusterError> {
        self.hosts
            .read()
            .await
            .get(host_id)
            .cloned()
            .ok_or_else(|| ClusterError::HostNotFound(host_id.to_string()))
    }
}

#[async_trait]
impl ClusterClient for LocalCluster {
    async fn list_hosts(&self) -> Result<HashMap<String, HostState>, ClusterError> {
        let hosts = self.hosts.read().await;
        Ok(hosts
            .iter()
            .map(|(id, host)| (id.clone(), host.state()))
            .collect())
    }

    async fn dial_host(&self, host_id: &str) -> Result<Box<dyn HostClient>, ClusterError> {
        let host = self.host(host_id).await?;
        Ok(Box::new(LocalHostClient {
            host,
            closed: AtomicBool::new(false),
        }))
    }

    async fn add_jobs(&self, req: AddJobsRequest) -> Result<(), ClusterError> {
        let mut batches = Vec::with_capacity(req.host_jobs.len());
        for (host_id, jobs) in req.host_jobs {
            batches.push((self.host(&host_id).await?, jobs));
        }
        for (host, jobs) in batches {
            for job in jobs {
                host.start(job).await?;
            }
        }
        Ok(())
    }
}

struct LocalHostClient {
    host: Arc<LocalHost>,
    closed: AtomicBool,
}

impl LocalHostClient {
    fn check_open(&self) -> Result<(), ClusterError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClusterError::Unavailable(format!(
                "connection to host {} is closed",
                self.host.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl HostClient for LocalHostClient {
    fn host_id(&self) -> &str {
        &self.host.id
    }

    async fn attach(&self, req: AttachRequest, wait: bool) -> Result<AttachSession, ClusterError> {
        self.check_open()?;
        self.host.attach(req, wait)
    }

    async fn detach(&self, job_id: &str) -> Result<(), ClusterError> {
        self.check_open()?;
        self.host.detach(job_id);
        Ok(())
    }

    async fn stop_job(&self, job_id: &str) -> Result<(), ClusterError> {
        self.check_open()?;
        self.host.stop(job_id)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
