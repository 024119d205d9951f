//! Reading job output, either as raw bytes or as a server-sent event stream.

pub mod mux;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::cluster::{
    AttachFlags, AttachRequest, AttachSession, AttachStream, ClusterClient, ClusterError, HostLease,
};
use crate::demux;
use crate::error::{ControllerError, Phase, Result};
use crate::scheduler::CompositeJobId;

pub use mux::{Encoding, MuxStream, StreamMux, SSE_EOF};

const COPY_CHUNK: usize = 32 * 1024;

/// Buffer between a log copy and its [`LogBody`].
const BODY_PIPE_CAPACITY: usize = 64 * 1024;

pub struct JobLogReader {
    cluster: Arc<dyn ClusterClient>,
    attach_wait: Duration,
}

/// An attached job log, ready to be copied out.
pub struct JobLog {
    pub id: CompositeJobId,
    stream: AttachStream,
    tty: bool,
    host: HostLease,
}

impl std::fmt::Debug for JobLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLog")
            .field("id", &self.id)
            .field("tty", &self.tty)
            .finish_non_exhaustive()
    }
}

impl JobLogReader {
    pub fn new(cluster: Arc<dyn ClusterClient>, attach_wait: Duration) -> Self {
        Self {
            cluster,
            attach_wait,
        }
    }

    /// Attach to the output of job `id` (`<hostID>-<jobID>`).
    ///
    /// History is always included; `tail` keeps following until the job
    /// exits. A job that exists but has not started yet is waited for, up to
    /// the configured attach wait.
    pub async fn open(&self, id: &str, tail: bool) -> Result<JobLog> {
        let id = CompositeJobId::parse(id)?;
        let host = HostLease::dial(self.cluster.as_ref(), &id.host_id)
            .await
            .map_err(|e| ControllerError::cluster(Phase::Connect, e))?;

        let mut flags = AttachFlags::STDOUT | AttachFlags::STDERR | AttachFlags::LOGS;
        if tail {
            flags |= AttachFlags::STREAM;
        }
        let req = AttachRequest::new(id.job_id.clone(), flags);

        let session = match host.attach(req.clone(), false).await {
            Ok(session) => session,
            Err(ClusterError::AttachWouldWait) => {
                tracing::debug!(job_id = %id, "Job not running yet, waiting to attach");
                self.attach_when_ready(&host, req).await?
            }
            Err(e) => return Err(ControllerError::cluster(Phase::Attach, e)),
        };

        Ok(JobLog {
            id,
            stream: session.stream,
            tty: session.tty,
            host,
        })
    }

    async fn attach_when_ready(&self, host: &HostLease, req: AttachRequest) -> Result<AttachSession> {
        let job_id = req.job_id.clone();
        let mut session = host
            .attach(req, true)
            .await
            .map_err(|e| ControllerError::cluster(Phase::Attach, e))?;

        if let Some(ready) = session.ready.take() {
            match tokio::time::timeout(self.attach_wait, ready.wait()).await {
                Ok(result) => result.map_err(|e| ControllerError::cluster(Phase::AttachWait, e))?,
                Err(_) => {
                    if let Err(e) = host.detach(&job_id).await {
                        tracing::debug!(job_id = %job_id, error = %e, "Detach after attach timeout failed");
                    }
                    return Err(ControllerError::AttachWouldWait);
                }
            }
        }
        Ok(session)
    }
}

impl JobLog {
    /// Copy the log into `sink` and close it.
    ///
    /// Raw logs are the attach stream byte for byte. Event streams
    /// demultiplex stdout and stderr concurrently, one event per chunk read;
    /// a TTY job has a single combined stream reported as stdout. The eof
    /// event is only written when the source ended cleanly. The host
    /// connection is released on return.
    pub async fn copy_to<W>(self, sink: W, encoding: Encoding) -> io::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let JobLog {
            id,
            stream,
            tty,
            host,
        } = self;
        let mux = StreamMux::new(sink, encoding);

        let copied = match encoding {
            Encoding::Raw => forward(stream, mux.stream("raw")).await,
            Encoding::ServerSentEvents if tty => forward(stream, mux.stream("stdout")).await,
            Encoding::ServerSentEvents => {
                let (pump, stdout, stderr) = demux::split(stream);
                let (pumped, out, err) = tokio::join!(
                    pump,
                    forward(stdout, mux.stream("stdout")),
                    forward(stderr, mux.stream("stderr")),
                );
                pumped.and(out).and(err)
            }
        };

        // TODO: include the exit code in the eof event when tailing.
        let closed = match &copied {
            Ok(()) => mux.finish().await,
            Err(e) => {
                tracing::debug!(job_id = %id, error = %e, "Job log cut off");
                mux.abort().await
            }
        };
        drop(host);

        tracing::debug!(job_id = %id, "Job log finished");
        copied.and(closed)
    }

    /// Copy the log in the background and return the readable end.
    ///
    /// Dropping the body stops the copy and releases the attach and the host
    /// connection, even while a tailed job is quiet.
    pub fn into_body(self, encoding: Encoding) -> LogBody {
        let (sink, pipe) = tokio::io::duplex(BODY_PIPE_CAPACITY);
        let cancel = CancellationToken::new();
        let stopped = cancel.clone();
        let id = self.id.clone();

        tokio::spawn(async move {
            tokio::select! {
                result = self.copy_to(sink, encoding) => {
                    if let Err(e) = result {
                        tracing::debug!(job_id = %id, error = %e, "Log stream ended early");
                    }
                }
                _ = stopped.cancelled() => {
                    tracing::debug!(job_id = %id, "Log reader went away");
                }
            }
        });

        LogBody {
            pipe,
            _reader: cancel.drop_guard(),
        }
    }
}

/// Readable end of [`JobLog::into_body`].
pub struct LogBody {
    pipe: DuplexStream,
    _reader: DropGuard,
}

impl AsyncRead for LogBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().pipe).poll_read(cx, buf)
    }
}

async fn forward<R, W>(mut reader: R, stream: MuxStream<W>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; COPY_CHUNK];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        stream.write(&buf[..n]).await?;
    }
}
