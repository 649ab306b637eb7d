//! Tokio driver for a [`Connection`].
//!
//! Reads from the stream feed the connection; whatever the connection
//! queues is written back. Until the first key exchange completes the whole
//! exchange is bounded by the configured handshake timeout.
//!
//! ```rust,no_run
//! use strand_proto::ssh::{run_connection, AcceptAnyHostKey, Connection, Handler, TransportConfig};
//! use tokio::net::TcpStream;
//!
//! struct Client;
//! impl Handler for Client {}
//!
//! # async fn example() -> strand_platform::StrandResult<()> {
//! let stream = TcpStream::connect("127.0.0.1:22").await?;
//! let mut conn = Connection::client(TransportConfig::default(), AcceptAnyHostKey, Client)?;
//! run_connection(stream, &mut conn).await?;
//! # Ok(())
//! # }
//! ```

use std::io;

use bytes::Bytes;
use strand_platform::{DisconnectReason, StrandError, StrandResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::handler::Handler;

const READ_BUFFER: usize = 32 * 1024;

enum IoEvent {
    Wrote(io::Result<usize>),
    Read(io::Result<usize>),
}

/// Runs `conn` over `stream` until the connection is closed and its output
/// written.
///
/// # Errors
///
/// - [`StrandError::Timeout`] if the handshake does not finish in time
/// - I/O errors, including an unexpected EOF from the peer
/// - fatal protocol errors returned by [`Connection::feed`]
///
/// The connection has been torn down whenever an error is returned.
pub async fn run_connection<S, H>(stream: S, conn: &mut Connection<H>) -> StrandResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: Handler,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut buf = vec![0u8; READ_BUFFER];
    let deadline = Instant::now() + conn.session().config().handshake_timeout;

    loop {
        if conn.is_finished() {
            debug!("connection finished, shutting down writer");
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "shutdown failed");
            }
            return Ok(());
        }

        let pending = Bytes::copy_from_slice(conn.output_mut().chunk());
        let io = async {
            tokio::select! {
                res = writer.write(&pending), if !pending.is_empty() => IoEvent::Wrote(res),
                res = reader.read(&mut buf) => IoEvent::Read(res),
            }
        };

        let event = if conn.is_established() {
            io.await
        } else {
            match timeout_at(deadline, io).await {
                Ok(event) => event,
                Err(_) => {
                    warn!("handshake timed out");
                    conn.disconnect(DisconnectReason::ByApplication, "handshake timeout");
                    return Err(StrandError::Timeout("handshake".into()));
                }
            }
        };

        match event {
            IoEvent::Wrote(Ok(n)) => {
                conn.output_mut().advance(n);
            }
            IoEvent::Read(Ok(0)) => {
                if conn.is_closed() {
                    return Ok(());
                }
                info!("peer closed the stream");
                conn.session_mut().abort("peer closed the stream");
                conn.process_pending()?;
                return Err(StrandError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream closed before disconnect",
                )));
            }
            IoEvent::Read(Ok(n)) => {
                if conn.is_closed() {
                    continue;
                }
                conn.feed(&buf[..n])?;
            }
            IoEvent::Wrote(Err(e)) | IoEvent::Read(Err(e)) => {
                if conn.is_closed() {
                    debug!(error = %e, "transport error after close");
                    return Ok(());
                }
                warn!(error = %e, "transport error");
                conn.session_mut().abort(&e.to_string());
                conn.process_pending()?;
                return Err(StrandError::Io(e));
            }
        }
    }
}
