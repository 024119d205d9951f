//! Stream framing for non-TTY attach channels.
//!
//! Each frame is an 8-byte header followed by the payload:
//!
//! ```text
//! +--------+---------+-----------------------+
//! | kind:1 | zero:3  | payload length:4 (BE) |
//! +--------+---------+-----------------------+
//! ```
//!
//! `kind` is 1 for stdout and 2 for stderr.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

pub const HEADER_LEN: usize = 8;

/// Capacity of the pipes handed out by [`split`].
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn name(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }

    fn tag(self) -> u8 {
        match self {
            StreamKind::Stdout => 1,
            StreamKind::Stderr => 2,
        }
    }

    fn from_tag(tag: u8) -> io::Result<Self> {
        match tag {
            1 => Ok(StreamKind::Stdout),
            2 => Ok(StreamKind::Stderr),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown stream tag {}", other),
            )),
        }
    }
}

pub fn encode_header(kind: StreamKind, len: usize) -> io::Result<[u8; HEADER_LEN]> {
    let len = u32::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    let mut header = [0u8; HEADER_LEN];
    header[0] = kind.tag();
    header[4..].copy_from_slice(&len.to_be_bytes());
    Ok(header)
}

/// Write one frame. Empty payloads are skipped.
pub async fn write_frame<W>(writer: &mut W, kind: StreamKind, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if payload.is_empty() {
        return Ok(());
    }
    writer.write_all(&encode_header(kind, payload.len())?).await?;
    writer.write_all(payload).await
}

/// Read one frame, or `None` at a clean end of input.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<(StreamKind, Vec<u8>)>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated frame header",
            ));
        }
        filled += n;
    }

    let kind = StreamKind::from_tag(header[0])?;
    let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some((kind, payload)))
}

/// Split a framed reader into separate stdout and stderr pipes.
///
/// The returned future pumps frames into the pipes and must be polled
/// alongside whoever reads them. Both pipes reach end of input when the
/// source does. Once both readers are gone the pump stops with
/// `BrokenPipe` instead of draining the source.
pub fn split<R>(
    mut reader: R,
) -> (
    impl Future<Output = io::Result<()>> + Send,
    DuplexStream,
    DuplexStream,
)
where
    R: AsyncRead + Unpin + Send,
{
    let (mut stdout_tx, stdout_rx) = tokio::io::duplex(PIPE_CAPACITY);
    let (mut stderr_tx, stderr_rx) = tokio::io::duplex(PIPE_CAPACITY);

    let pump = async move {
        let mut stdout_open = true;
        let mut stderr_open = true;
        while let Some((kind, payload)) = read_frame(&mut reader).await? {
            let (pipe, open) = match kind {
                StreamKind::Stdout => (&mut stdout_tx, &mut stdout_open),
                StreamKind::Stderr => (&mut stderr_tx, &mut stderr_open),
            };
            if !*open {
                continue;
            }
            // A reader that went away only loses its own stream.
            if let Err(e) = pipe.write_all(&payload).await {
                tracing::debug!(stream = kind.name(), error = %e, "Demux pipe closed");
                *open = false;
                if !stdout_open && !stderr_open {
                    return Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "all demux readers closed",
                    ));
                }
            }
        }
        let _ = stdout_tx.shutdown().await;
        let _ = stderr_tx.shutdown().await;
        Ok(())
    };

    (pump, stdout_rx, stderr_rx)
}
