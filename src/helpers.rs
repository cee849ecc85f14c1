//! Byte-stream couplers used to bridge channels, sockets and process pipes.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Copy everything from `src` to `dst`, then shut down the write side of
/// `dst`. Returns the number of bytes copied. Errors other than EOF are
/// logged and terminate this coupler only.
pub async fn copy_and_close<R, W>(mut src: R, mut dst: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = copy(&mut src, &mut dst).await;
    if let Err(e) = dst.shutdown().await {
        debug!(error = %e, "failed to close write side");
    }
    copied
}

/// Copy everything from `src` to `dst` without closing either side. Used
/// when closure of the upstream is the termination trigger.
pub async fn copy<R, W>(src: &mut R, dst: &mut W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; 32 * 1024];
    let mut copied = 0u64;
    loop {
        let n = match src.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "copy read failed");
                break;
            }
        };
        if let Err(e) = dst.write_all(&buffer[..n]).await {
            debug!(error = %e, "copy write failed");
            break;
        }
        copied += n as u64;
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_copy_moves_all_bytes() {
        let (mut a, mut b) = tokio::io::duplex(64);

        tokio::spawn(async move {
            a.write_all(b"hello coupler").await.unwrap();
            a.shutdown().await.unwrap();
        });

        let mut sink = Cursor::new(Vec::new());
        let copied = copy(&mut b, &mut sink).await;
        assert_eq!(copied, 13);
        assert_eq!(sink.into_inner(), b"hello coupler");
    }

    #[tokio::test]
    async fn test_copy_and_close_shuts_down_destination() {
        let (mut client, server) = tokio::io::duplex(64);
        let (server_read, mut server_write) = tokio::io::split(server);

        let copier = tokio::spawn(async move {
            // server -> client, closing the client-facing write side at EOF.
            copy_and_close(server_read, &mut client).await;
            client
        });

        server_write.write_all(b"payload").await.unwrap();
        server_write.shutdown().await.unwrap();

        let mut client = copier.await.unwrap();
        let mut out = Vec::new();
        // read_to_end only returns because the coupler shut the stream down.
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"payload");
    }

    #[tokio::test]
    async fn test_copy_empty_stream() {
        let (a, mut b) = tokio::io::duplex(16);
        drop(a);
        let mut sink = Cursor::new(Vec::new());
        let copied = copy(&mut b, &mut sink).await;
        assert_eq!(copied, 0);
        assert!(sink.into_inner().is_empty());
    }
}
