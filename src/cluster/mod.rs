//! Boundary to the cluster: host discovery, per-host dialing, job submission
//! and the attach protocol.
//!
//! The control plane never owns jobs. Everything it knows about running work
//! comes from [`ClusterClient::list_hosts`], and everything it does to a job
//! goes through a [`HostClient`] obtained from [`ClusterClient::dial_host`].
//!
//! # Attach
//!
//! An attach yields an [`AttachSession`]: a duplex byte stream plus, when the
//! job did not exist yet, an [`AttachReady`] handle that resolves once the
//! host has wired the stream to the started process. Registering the attach
//! before submitting the job is what guarantees no early output is lost.
//!
//! Non-TTY streams carry [`crate::demux`] frames; TTY streams carry raw bytes.

pub mod lease;
pub mod local;
pub mod runner;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use crate::catalog::ImageRef;

pub use lease::HostLease;
pub use local::LocalCluster;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job is not running and wait was not requested")]
    AttachWouldWait,

    #[error("host unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("attach closed before the job started")]
    Closed,
}

/// Runtime configuration of a job's container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub image: ImageRef,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub stdin_once: bool,
    pub open_stdin: bool,
    pub tty: bool,
}

/// A job as submitted to, and reported by, a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Host-local job ID.
    pub id: String,
    pub app_id: String,
    pub release_id: String,
    /// Process type from the release; empty for ad-hoc commands.
    #[serde(default)]
    pub job_type: String,
    /// Opaque metadata carried alongside the job.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub config: ContainerConfig,
}

/// Snapshot of one host and the jobs currently running on it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostState {
    pub id: String,
    pub jobs: Vec<JobSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct AddJobsRequest {
    pub host_jobs: HashMap<String, Vec<JobSpec>>,
}

/// Selects which parts of a job's I/O an attach includes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AttachFlags(u8);

impl AttachFlags {
    pub const STDOUT: AttachFlags = AttachFlags(1);
    pub const STDERR: AttachFlags = AttachFlags(1 << 1);
    pub const STDIN: AttachFlags = AttachFlags(1 << 2);
    /// Replay output produced before the attach.
    pub const LOGS: AttachFlags = AttachFlags(1 << 3);
    /// Keep following output until the job exits.
    pub const STREAM: AttachFlags = AttachFlags(1 << 4);

    pub const fn empty() -> Self {
        AttachFlags(0)
    }

    pub const fn contains(self, other: AttachFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AttachFlags {
    type Output = AttachFlags;

    fn bitor(self, rhs: AttachFlags) -> AttachFlags {
        AttachFlags(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for AttachFlags {
    fn bitor_assign(&mut self, rhs: AttachFlags) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachRequest {
    pub job_id: String,
    pub flags: AttachFlags,
    /// Terminal rows, 0 when unknown.
    pub height: u16,
    /// Terminal columns, 0 when unknown.
    pub width: u16,
}

impl AttachRequest {
    pub fn new(job_id: impl Into<String>, flags: AttachFlags) -> Self {
        Self {
            job_id: job_id.into(),
            flags,
            height: 0,
            width: 0,
        }
    }
}

/// Any duplex byte stream usable as an attach channel.
pub trait AttachIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AttachIo for T {}

pub type AttachStream = Box<dyn AttachIo>;

/// Resolves once the host has connected a pre-registered attach to the job.
#[derive(Debug)]
pub struct AttachReady {
    rx: oneshot::Receiver<Result<(), String>>,
}

impl AttachReady {
    pub fn new(rx: oneshot::Receiver<Result<(), String>>) -> Self {
        Self { rx }
    }

    /// Pair used by host implementations: the sender side signals readiness.
    pub fn channel() -> (oneshot::Sender<Result<(), String>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    pub async fn wait(self) -> Result<(), ClusterError> {
        match self.rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(msg)) => Err(ClusterError::Unavailable(msg)),
            Err(_) => Err(ClusterError::Closed),
        }
    }
}

pub struct AttachSession {
    pub stream: AttachStream,
    /// Present when the job did not exist at attach time.
    pub ready: Option<AttachReady>,
    /// The stream carries raw terminal bytes rather than [`crate::demux`]
    /// frames. Only known when the job existed at attach time.
    pub tty: bool,
}

impl AttachSession {
    pub fn new(stream: AttachStream) -> Self {
        Self {
            stream,
            ready: None,
            tty: false,
        }
    }

    pub fn pending(stream: AttachStream, ready: AttachReady) -> Self {
        Self {
            stream,
            ready: Some(ready),
            tty: false,
        }
    }

    pub fn with_tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    /// Tear down a session whose job will never run.
    ///
    /// Signals end of input, then reads whatever the host still sends until
    /// it closes its side or `timeout` elapses. Returns the number of bytes
    /// discarded.
    pub async fn drain(mut self, timeout: Duration) -> u64 {
        if let Err(e) = self.stream.shutdown().await {
            tracing::debug!(error = %e, "Attach shutdown failed during drain");
        }

        let mut discarded = 0u64;
        let mut buf = [0u8; 4096];
        let read_all = async {
            loop {
                match self.stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => discarded += n as u64,
                }
            }
        };
        if tokio::time::timeout(timeout, read_all).await.is_err() {
            tracing::debug!("Attach drain timed out");
        }
        discarded
    }
}

impl std::fmt::Debug for AttachSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachSession")
            .field("pending", &self.ready.is_some())
            .field("tty", &self.tty)
            .finish()
    }
}

/// Cluster-wide host directory and scheduler entry point.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_hosts(&self) -> Result<HashMap<String, HostState>, ClusterError>;

    async fn dial_host(&self, host_id: &str) -> Result<Box<dyn HostClient>, ClusterError>;

    async fn add_jobs(&self, req: AddJobsRequest) -> Result<(), ClusterError>;
}

/// A dialed connection to one host.
#[async_trait]
pub trait HostClient: Send + Sync {
    fn host_id(&self) -> &str;

    /// Attach to a job's I/O. With `wait`, a job that does not exist yet is
    /// registered and the returned session carries an [`AttachReady`].
    async fn attach(&self, req: AttachRequest, wait: bool) -> Result<AttachSession, ClusterError>;

    /// Drop a pending attach registered for a job that will never start.
    async fn detach(&self, job_id: &str) -> Result<(), ClusterError>;

    async fn stop_job(&self, job_id: &str) -> Result<(), ClusterError>;

    /// Release the connection. Called exactly once, by [`HostLease`].
    fn close(&self);
}
