use std::io;
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Marker written once after the last event of an event stream.
pub const SSE_EOF: &[u8] = b"event: eof\ndata: {}\n\n";

/// How frames are laid out in the shared sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Bytes are copied through unframed.
    Raw,
    /// `data: {"stream":..,"data":..}` records, one per write.
    ServerSentEvents,
}

#[derive(Serialize)]
struct LogChunk<'a> {
    stream: &'a str,
    data: &'a str,
}

struct Shared<W> {
    sink: Mutex<W>,
    encoding: Encoding,
}

/// Serializes several named byte streams into one sink.
///
/// Handles from [`StreamMux::stream`] may be written concurrently from
/// different tasks; each write becomes one frame and frames never interleave.
pub struct StreamMux<W> {
    shared: Arc<Shared<W>>,
}

/// Writer for one named stream of a [`StreamMux`].
pub struct MuxStream<W> {
    shared: Arc<Shared<W>>,
    name: Arc<str>,
}

impl<W> Clone for MuxStream<W> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            name: Arc::clone(&self.name),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> StreamMux<W> {
    pub fn new(sink: W, encoding: Encoding) -> Self {
        Self {
            shared: Arc::new(Shared {
                sink: Mutex::new(sink),
                encoding,
            }),
        }
    }

    pub fn stream(&self, name: &str) -> MuxStream<W> {
        MuxStream {
            shared: Arc::clone(&self.shared),
            name: Arc::from(name),
        }
    }

    /// Write the end-of-stream marker (event streams only) and close the sink.
    pub async fn finish(&self) -> io::Result<()> {
        let mut sink = self.shared.sink.lock().await;
        if self.shared.encoding == Encoding::ServerSentEvents {
            sink.write_all(SSE_EOF).await?;
        }
        sink.flush().await?;
        sink.shutdown().await
    }

    /// Close the sink without an end-of-stream marker, so readers can tell
    /// a cut-off stream from a complete one.
    pub async fn abort(&self) -> io::Result<()> {
        let mut sink = self.shared.sink.lock().await;
        sink.flush().await?;
        sink.shutdown().await
    }

    /// Take the sink back. Returns `None` while any stream handle is alive.
    pub fn into_inner(self) -> Option<W> {
        Arc::try_unwrap(self.shared)
            .ok()
            .map(|shared| shared.sink.into_inner())
    }
}

impl<W: AsyncWrite + Unpin + Send> MuxStream<W> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Emit `chunk` as exactly one frame. Returns the number of input bytes
    /// consumed, which is always all of them.
    pub async fn write(&self, chunk: &[u8]) -> io::Result<usize> {
        let mut sink = self.shared.sink.lock().await;
        match self.shared.encoding {
            Encoding::Raw => sink.write_all(chunk).await?,
            Encoding::ServerSentEvents => {
                let data = String::from_utf8_lossy(chunk);
                let record = serde_json::to_vec(&LogChunk {
                    stream: &self.name,
                    data: &data,
                })
                .map_err(io::Error::other)?;
                sink.write_all(b"data: ").await?;
                sink.write_all(&record).await?;
                sink.write_all(b"\n\n").await?;
            }
        }
        sink.flush().await?;
        Ok(chunk.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn parse_frames(out: &[u8]) -> Vec<(String, String)> {
        let text = String::from_utf8(out.to_vec()).unwrap();
        text.split("\n\n")
            .filter(|frame| !frame.is_empty())
            .map(|frame| {
                let json = frame.strip_prefix("data: ").expect("frame prefix");
                let value: Value = serde_json::from_str(json).unwrap();
                (
                    value["stream"].as_str().unwrap().to_string(),
                    value["data"].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn sse_frame_layout() {
        let mux = StreamMux::new(Vec::new(), Encoding::ServerSentEvents);
        let out = mux.stream("stdout");
        assert_eq!(out.write(b"hello").await.unwrap(), 5);
        drop(out);

        let sink = mux.into_inner().unwrap();
        assert_eq!(sink, b"data: {\"stream\":\"stdout\",\"data\":\"hello\"}\n\n");
    }

    #[tokio::test]
    async fn sse_escapes_payload() {
        let mux = StreamMux::new(Vec::new(), Encoding::ServerSentEvents);
        mux.stream("stderr").write(b"a\"b\nc").await.unwrap();

        let sink = mux.into_inner().unwrap();
        assert_eq!(
            parse_frames(&sink),
            vec![("stderr".to_string(), "a\"b\nc".to_string())]
        );
    }

    #[tokio::test]
    async fn raw_encoding_is_unframed() {
        let mux = StreamMux::new(Vec::new(), Encoding::Raw);
        mux.stream("stdout").write(b"one ").await.unwrap();
        mux.stream("stderr").write(b"two").await.unwrap();
        mux.finish().await.unwrap();

        assert_eq!(mux.into_inner().unwrap(), b"one two");
    }

    #[tokio::test]
    async fn finish_appends_eof_marker() {
        let mux = StreamMux::new(Vec::new(), Encoding::ServerSentEvents);
        mux.stream("stdout").write(b"x").await.unwrap();
        mux.finish().await.unwrap();

        let sink = mux.into_inner().unwrap();
        assert!(sink.ends_with(SSE_EOF));
    }

    #[tokio::test]
    async fn abort_leaves_out_eof_marker() {
        let mux = StreamMux::new(Vec::new(), Encoding::ServerSentEvents);
        mux.stream("stdout").write(b"x").await.unwrap();
        mux.abort().await.unwrap();

        let sink = mux.into_inner().unwrap();
        assert_eq!(sink, b"data: {\"stream\":\"stdout\",\"data\":\"x\"}\n\n");
    }

    #[tokio::test]
    async fn into_inner_refuses_while_handles_live() {
        let mux = StreamMux::new(Vec::new(), Encoding::Raw);
        let _handle = mux.stream("stdout");
        assert!(mux.into_inner().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writers_never_interleave() {
        const WRITES: usize = 200;

        let mux = StreamMux::new(Vec::new(), Encoding::ServerSentEvents);
        let mut tasks = Vec::new();
        for name in ["stdout", "stderr"] {
            let handle = mux.stream(name);
            tasks.push(tokio::spawn(async move {
                for i in 0..WRITES {
                    let chunk = format!("{}-{}", handle.name(), i);
                    handle.write(chunk.as_bytes()).await.unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let frames = parse_frames(&mux.into_inner().unwrap());
        assert_eq!(frames.len(), WRITES * 2);
        for name in ["stdout", "stderr"] {
            let data: Vec<&str> = frames
                .iter()
                .filter(|(stream, _)| stream == name)
                .map(|(_, data)| data.as_str())
                .collect();
            let expected: Vec<String> = (0..WRITES).map(|i| format!("{}-{}", name, i)).collect();
            assert_eq!(data, expected);
        }
    }
}
