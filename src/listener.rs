use anyhow::{Context, Result, anyhow};
use socket2::{Domain, Socket, Type};
use std::{
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};
use tokio::net::{TcpListener, TcpStream, lookup_host};
use tracing::{error, warn};

use crate::config::Protocol;
use crate::proxy::handle_connection;

const LISTEN_BACKLOG: i32 = 1024;

/// Source of inbound connections for [`serve`].
pub trait Accept {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        Self::accept(self)
    }
}

/// Splits `host:port`, `:port` or `[v6]:port` into host and port.
/// An empty string means any host and an ephemeral port.
pub fn split_host_port(listen: &str) -> Result<(&str, u16)> {
    if listen.is_empty() {
        return Ok(("", 0));
    }

    let (host, port) = listen
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("Missing port in address {listen}"))?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .ok_or_else(|| anyhow!("Missing ']' in address {listen}"))?,
        None if host.contains(':') => {
            return Err(anyhow!("Too many colons in address {listen}"));
        }
        None => host,
    };
    let port = port
        .parse()
        .with_context(|| format!("Invalid port in address {listen}"))?;

    Ok((host, port))
}

/// Resolves the listen string to one socket address usable by `protocol`.
pub async fn resolve_listen_addr(listen: &str, protocol: Protocol) -> Result<SocketAddr> {
    let (host, port) = split_host_port(listen)?;

    if host.is_empty() {
        let ip = match protocol {
            Protocol::Tcp4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Protocol::Tcp | Protocol::Tcp6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        return Ok(SocketAddr::new(ip, port));
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if !protocol.accepts(ip) {
            return Err(anyhow!("Address {ip} is not usable with protocol {protocol}"));
        }
        return Ok(SocketAddr::new(ip, port));
    }

    lookup_host((host, port))
        .await
        .with_context(|| format!("Failed to resolve listen host {host}"))?
        .find(|addr| protocol.accepts(addr.ip()))
        .ok_or_else(|| anyhow!("No {protocol} address found for {host}"))
}

/// Builds a non-blocking listening socket for `addr`. IPv6 sockets are
/// dual-stack only for [`Protocol::Tcp`].
pub fn bind_addr(addr: SocketAddr, protocol: Protocol) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    if addr.is_ipv6() {
        socket.set_only_v6(protocol == Protocol::Tcp6)?;
    }
    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

pub async fn bind(listen: &str, protocol: Protocol) -> Result<TcpListener> {
    let addr = resolve_listen_addr(listen, protocol).await?;
    let listener =
        bind_addr(addr, protocol).with_context(|| format!("Failed to bind to address {addr}"))?;
    TcpListener::from_std(listener).context("Failed to register listener with the runtime")
}

/// Accepts connections forever, pairing each with a fresh connection to
/// `forward` on its own task. Accept errors are logged and skipped.
pub async fn serve<L: Accept>(mut listener: L, forward: Arc<str>) {
    loop {
        match listener.accept().await {
            Ok((stream, client_addr)) => {
                let forward = Arc::clone(&forward);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, client_addr, &forward).await {
                        let error = format!("{e:#}");
                        warn!(client_addr = %client_addr, %error, "Connection failed");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}
