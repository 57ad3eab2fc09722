//! Network subsystem for UDP audio transport

pub mod packet;
pub mod receiver;
pub mod sender;

pub use packet::Packet;
pub use receiver::{ReceiverStats, TransportReceiver};
pub use sender::{SenderStats, TransportSender};

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

use crate::error::NetworkError;

/// Blocking UDP socket bound to `addr`, with a receive timeout
pub fn create_socket(addr: SocketAddr, read_timeout: Duration) -> Result<UdpSocket, NetworkError> {
    let bind_err = |e: std::io::Error| NetworkError::BindFailed(format!("{}: {}", addr, e));
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.set_read_timeout(Some(read_timeout)).map_err(bind_err)?;
    Ok(socket.into())
}

/// Resolve `host`, `host:port`, `ip` or `[ipv6]:port`, using `default_port`
/// when none is given
pub fn resolve(host: &str, default_port: u16) -> Result<SocketAddr, NetworkError> {
    let host = host.trim();
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    let (name, port) = host
        .rsplit_once(':')
        .and_then(|(name, port)| port.parse::<u16>().ok().map(|port| (name, port)))
        .unwrap_or((host, default_port));
    (name, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::Resolve(format!("{}: {}", host, e)))?
        .next()
        .ok_or_else(|| NetworkError::Resolve(host.to_string()))
}

/// Timeouts surface as different kinds depending on the platform
pub(crate) fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_forms() {
        assert_eq!(
            resolve("192.168.1.20", 5000).unwrap(),
            "192.168.1.20:5000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve("192.168.1.20:6000", 5000).unwrap(),
            "192.168.1.20:6000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            resolve("::1", 5000).unwrap(),
            "[::1]:5000".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(resolve("localhost:7000", 5000).unwrap().port(), 7000);
    }

    #[test]
    fn test_create_socket_on_ephemeral_port() {
        let socket = create_socket("127.0.0.1:0".parse().unwrap(), Duration::from_millis(10)).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }
}
