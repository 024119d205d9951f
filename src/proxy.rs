use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Bytes moved in each direction by [`proxy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStats {
    pub to_job: u64,
    pub to_client: u64,
}

/// Copy `from` into `to` until end of input, then half-close `to`.
async fn pipe<R, W>(direction: &'static str, mut from: R, mut to: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match tokio::io::copy(&mut from, &mut to).await {
        Ok(n) => n,
        Err(e) => {
            tracing::debug!(direction, error = %e, "Copy ended with error");
            0
        }
    };
    if let Err(e) = to.shutdown().await {
        tracing::debug!(direction, error = %e, "Half-close failed");
    }
    copied
}

/// Bridge a client connection and a job's attach stream in both directions.
///
/// Each direction runs until its source ends and then half-closes its
/// destination, so the job can keep writing after the client stops sending
/// and vice versa. Returns once both directions are done; the caller drops
/// both streams afterwards.
pub async fn proxy<C, J>(client: C, job: J) -> ProxyStats
where
    C: AsyncRead + AsyncWrite,
    J: AsyncRead + AsyncWrite,
{
    let (client_rd, client_wr) = tokio::io::split(client);
    let (job_rd, job_wr) = tokio::io::split(job);

    let (to_job, to_client) = tokio::join!(
        pipe("client->job", client_rd, job_wr),
        pipe("job->client", job_rd, client_wr),
    );

    ProxyStats { to_job, to_client }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn copies_both_directions() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (job, mut job_peer) = tokio::io::duplex(1024);

        let session = tokio::spawn(proxy(client, job));

        client_peer.write_all(b"input").await.unwrap();
        client_peer.shutdown().await.unwrap();

        let mut received = Vec::new();
        job_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"input");

        job_peer.write_all(b"output").await.unwrap();
        job_peer.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        client_peer.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"output");

        let stats = session.await.unwrap();
        assert_eq!(
            stats,
            ProxyStats {
                to_job: 5,
                to_client: 6
            }
        );
    }

    #[tokio::test]
    async fn job_output_outlives_client_input() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (job, mut job_peer) = tokio::io::duplex(1024);

        let session = tokio::spawn(proxy(client, job));

        // Client is done sending right away.
        client_peer.shutdown().await.unwrap();
        let mut stdin = Vec::new();
        job_peer.read_to_end(&mut stdin).await.unwrap();
        assert!(stdin.is_empty());

        // The session stays open while the job keeps producing output.
        tokio::task::yield_now().await;
        assert!(!session.is_finished());

        for chunk in [&b"one "[..], b"two ", b"three"] {
            job_peer.write_all(chunk).await.unwrap();
        }
        job_peer.shutdown().await.unwrap();

        let mut output = Vec::new();
        client_peer.read_to_end(&mut output).await.unwrap();
        assert_eq!(output, b"one two three");

        let stats = session.await.unwrap();
        assert_eq!(stats.to_job, 0);
        assert_eq!(stats.to_client, 13);
    }

    #[tokio::test]
    async fn waits_for_both_directions() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (job, mut job_peer) = tokio::io::duplex(1024);

        let session = tokio::spawn(proxy(client, job));

        // Job finishes first; client input is still open.
        job_peer.shutdown().await.unwrap();
        let mut output = Vec::new();
        client_peer.read_to_end(&mut output).await.unwrap();
        assert!(output.is_empty());

        tokio::task::yield_now().await;
        assert!(!session.is_finished());

        client_peer.write_all(b"late").await.unwrap();
        client_peer.shutdown().await.unwrap();
        let mut stdin = Vec::new();
        job_peer.read_to_end(&mut stdin).await.unwrap();
        assert_eq!(stdin, b"late");

        session.await.unwrap();
    }
}
