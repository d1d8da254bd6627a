//! Socket construction through `socket2`, so buffer sizes and address reuse
//! are applied before bind.

use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Result, TransportError};

/// Options applied to every socket this crate binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketConfig {
    /// `SO_RCVBUF` request; the kernel may round it.
    pub recv_buffer_size: Option<usize>,
    pub reuse_address: bool,
    /// Receive loops wake at this interval to observe shutdown.
    pub read_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: Some(1024 * 1024),
            reuse_address: true,
            read_timeout: Duration::from_millis(200),
        }
    }
}

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

fn apply_common(socket: &Socket, config: &SocketConfig) -> Result<()> {
    if config.reuse_address {
        socket
            .set_reuse_address(true)
            .map_err(|source| TransportError::SocketOption {
                option: "SO_REUSEADDR",
                source,
            })?;
    }
    if let Some(size) = config.recv_buffer_size {
        socket
            .set_recv_buffer_size(size)
            .map_err(|source| TransportError::SocketOption {
                option: "SO_RCVBUF",
                source,
            })?;
    }
    Ok(())
}

/// Bind a UDP socket with the configured options.
pub fn bind_udp(addr: SocketAddr, config: &SocketConfig) -> Result<UdpSocket> {
    let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))?;
    apply_common(&socket, config)?;
    socket
        .bind(&addr.into())
        .map_err(|source| TransportError::Bind { addr, source })?;

    let socket: UdpSocket = socket.into();
    socket.set_read_timeout(Some(config.read_timeout))?;
    tracing::debug!(
        addr = %socket.local_addr()?,
        recv_buffer = ?config.recv_buffer_size,
        "udp socket bound"
    );
    Ok(socket)
}

/// Bind a TCP listener with the configured options.
pub fn bind_tcp(addr: SocketAddr, config: &SocketConfig) -> Result<TcpListener> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;
    apply_common(&socket, config)?;
    socket
        .bind(&addr.into())
        .map_err(|source| TransportError::Bind { addr, source })?;
    socket.listen(128)?;

    let listener: TcpListener = socket.into();
    tracing::debug!(addr = %listener.local_addr()?, "tcp listener bound");
    Ok(listener)
}
