use anyhow::{Context, Result};
use socket2::{SockRef, Socket};
use std::{
    fmt, io,
    net::{Shutdown, SocketAddr},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{Instrument, debug, error, info};

pub const BUFFER_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Client to forward target
    Upstream,
    /// Forward target to client
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Upstream => "upstream",
            Self::Downstream => "downstream",
        })
    }
}

/// How a relay loop stopped. Only used for logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayEnd {
    /// The source reported end-of-stream.
    Eof,
    /// A connection was already gone (peer reset, closed by the sibling relay).
    Closed,
    /// Any other I/O error.
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes: u64,
    pub end: RelayEnd,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionStats {
    pub upstream: RelayStats,
    pub downstream: RelayStats,
}

/// Errors that mean the other side (or the sibling relay) already closed the
/// connection. These end a relay quietly.
#[must_use]
pub fn is_expected_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

fn classify(op: &'static str, err: &io::Error) -> RelayEnd {
    if is_expected_close(err) {
        debug!(error = %err, "Connection closed during {op}");
        RelayEnd::Closed
    } else {
        error!(error = %err, "Failed to {op}");
        RelayEnd::Failed
    }
}

/// Shuts down both directions of `socket` so a relay blocked reading it wakes
/// up with end-of-stream.
fn close_socket(socket: &Socket, peer: &'static str) {
    if let Err(e) = socket.shutdown(Shutdown::Both) {
        if !is_expected_close(&e) {
            debug!(error = %e, "Failed to close {peer} connection");
        }
    }
}

/// Dials the forward target for an accepted connection and relays bytes both
/// ways until both directions have finished.
///
/// When one relay finishes, the socket it was writing to is closed in both
/// directions, which ends the other relay without waiting on the remote peer.
/// If the dial fails no relay is started and `inbound` is closed on return.
#[tracing::instrument(skip(inbound, forward), fields(client_addr = %client_addr))]
pub async fn handle_connection(
    inbound: TcpStream,
    client_addr: SocketAddr,
    forward: &str,
) -> Result<SessionStats> {
    debug!(forward_addr = %forward, "Attempting to connect to forward target");
    let outbound = TcpStream::connect(forward)
        .await
        .with_context(|| format!("Failed to connect to forward target {forward}"))?;
    let target_addr = outbound
        .peer_addr()
        .context("Failed to get forward target address")?;

    let client_socket = SockRef::from(&inbound)
        .try_clone()
        .context("Failed to duplicate client socket")?;
    let target_socket = SockRef::from(&outbound)
        .try_clone()
        .context("Failed to duplicate forward target socket")?;

    info!(%client_addr, %target_addr, "Proxying");

    let (client_reader, client_writer) = inbound.into_split();
    let (target_reader, target_writer) = outbound.into_split();

    let mut upstream = tokio::spawn(
        relay(client_reader, target_writer, Direction::Upstream).in_current_span(),
    );
    let mut downstream = tokio::spawn(
        relay(target_reader, client_writer, Direction::Downstream).in_current_span(),
    );

    let (upstream, downstream) = tokio::select! {
        result = &mut upstream => {
            close_socket(&target_socket, "forward target");
            (result, (&mut downstream).await)
        }
        result = &mut downstream => {
            close_socket(&client_socket, "client");
            ((&mut upstream).await, result)
        }
    };

    let stats = SessionStats {
        upstream: upstream.context("Upstream relay task failed")?,
        downstream: downstream.context("Downstream relay task failed")?,
    };

    info!(
        %client_addr,
        %target_addr,
        bytes_up = stats.upstream.bytes,
        bytes_down = stats.downstream.bytes,
        "Closed"
    );
    Ok(stats)
}

/// Copies `src` into `dst` until `src` ends or either side fails, then shuts
/// down `dst`.
#[tracing::instrument(level = "debug", skip(src, dst))]
pub async fn relay<R, W>(mut src: R, mut dst: W, direction: Direction) -> RelayStats
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut bytes = 0u64;

    let end = loop {
        let n = match src.read(&mut buffer).await {
            Ok(0) => break RelayEnd::Eof,
            Ok(n) => n,
            Err(e) => break classify("read", &e),
        };
        if let Err(e) = dst.write_all(&buffer[..n]).await {
            break classify("write", &e);
        }
        bytes += n as u64;
    };

    if let Err(e) = dst.shutdown().await {
        if !is_expected_close(&e) {
            debug!(error = %e, "Failed to shut down destination");
        }
    }

    debug!(bytes, end = ?end, "Relay finished");
    RelayStats { bytes, end }
}
