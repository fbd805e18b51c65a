//! Moving bytes between a local TCP leg and a tunnel stream.

use std::{io, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::STREAM_HEADER;

/// The bidirectional QUIC stream carrying the bytes of one tunnel.
#[derive(Debug)]
pub(crate) struct Tunnel {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

/// Opens the tunnel stream of `connection`.
pub(crate) async fn open_tunnel(connection: &quinn::Connection) -> io::Result<Tunnel> {
    let (mut send, recv) = connection.open_bi().await?;
    send.write_all(&STREAM_HEADER).await?;
    Ok(Tunnel { send, recv })
}

/// Accepts the tunnel stream the peer opened on `connection`.
pub(crate) async fn accept_tunnel(connection: &quinn::Connection) -> io::Result<Tunnel> {
    let (send, mut recv) = connection.accept_bi().await?;
    let mut header = [0u8; STREAM_HEADER.len()];
    AsyncReadExt::read_exact(&mut recv, &mut header).await?;
    if header != STREAM_HEADER {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unexpected stream header",
        ));
    }
    Ok(Tunnel { send, recv })
}

/// Copies bytes both ways until both directions ended.
///
/// The end of one direction is propagated to its writer.  When `cancel` fires, or one
/// direction fails, both directions end gracefully: writers are shut down and readers are
/// drained, each bounded by `end_timeout`, after which the legs are dropped.
pub(crate) async fn splice<L>(
    local: L,
    tunnel: Tunnel,
    cancel: &CancellationToken,
    end_timeout: Duration,
) -> io::Result<()>
where
    L: AsyncRead + AsyncWrite + Unpin,
{
    let (local_read, local_write) = tokio::io::split(local);
    let Tunnel { send, recv } = tunnel;
    let ending = cancel.child_token();

    let upstream = async {
        match pipe(local_read, send, &ending, end_timeout).await {
            Ok(send) => {
                // wait for the peer to read the stream to its end
                time::timeout(end_timeout, send.stopped()).await.ok();
                Ok(())
            }
            Err(err) => {
                ending.cancel();
                Err(err)
            }
        }
    };
    let downstream = async {
        let res = pipe(recv, local_write, &ending, end_timeout).await;
        if res.is_err() {
            ending.cancel();
        }
        res.map(|_| ())
    };

    let (upstream, downstream) = tokio::join!(upstream, downstream);
    upstream.and(downstream)
}

/// Copies from `reader` to `writer` until the reader ends or `cancel` fires.
async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    cancel: &CancellationToken,
    end_timeout: Duration,
) -> io::Result<W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::select! {
        res = tokio::io::copy(&mut reader, &mut writer) => Some(res?),
        _ = cancel.cancelled() => None,
    };
    match copied {
        Some(bytes) => {
            debug!(bytes, "end of stream");
            writer.shutdown().await?;
        }
        None => {
            let end = async {
                writer.shutdown().await?;
                tokio::io::copy(&mut reader, &mut tokio::io::sink()).await
            };
            match time::timeout(end_timeout, end).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => debug!("graceful end failed: {err:#}"),
                Err(_) => debug!("graceful end timed out after {end_timeout:?}"),
            }
        }
    }
    Ok(writer)
}
