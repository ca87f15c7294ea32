//! Bidirectional TCP byte pump.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Relay data between two TCP streams until either side finishes.
///
/// As soon as one direction sees end-of-stream or an error, both streams are
/// shut down and closed; the other direction is dropped mid-read.
///
/// Returns (bytes_sent_to_target, bytes_received_from_target).
pub async fn relay_tcp(client: TcpStream, target: TcpStream, buffer_size: usize) -> (u64, u64) {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut target_read, mut target_write) = target.into_split();

    let mut bytes_sent: u64 = 0;
    let mut bytes_received: u64 = 0;

    let (side, outcome) = {
        let client_to_target =
            copy_half(&mut client_read, &mut target_write, buffer_size, &mut bytes_sent);
        let target_to_client =
            copy_half(&mut target_read, &mut client_write, buffer_size, &mut bytes_received);

        tokio::select! {
            res = client_to_target => ("client", res),
            res = target_to_client => ("target", res),
        }
    };

    match outcome {
        Ok(()) => debug!("Relay ended: {} closed its side", side),
        Err(e) => debug!("Relay ended: error on {} side: {}", side, e),
    }

    let _ = target_write.shutdown().await;
    let _ = client_write.shutdown().await;

    debug!(
        "Relay complete: sent={}, received={}",
        bytes_sent, bytes_received
    );

    (bytes_sent, bytes_received)
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    total: &mut u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(512)];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        *total += n as u64;
    }
}
