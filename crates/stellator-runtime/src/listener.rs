//! Listening socket

use crate::config::RootConfig;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{SocketAddr, SocketAddrV4};
use stellator_core::{Error, Result};

/// Create the shared IPv4 listening socket: `SO_REUSEADDR`, bound,
/// listening with `SOMAXCONN` backlog, non-blocking.
pub fn bind(config: &RootConfig) -> Result<Socket> {
    let ip = config.ipv4_address()?;
    let addr = SocketAddr::V4(SocketAddrV4::new(ip, config.port));

    let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| Error::socket("create", e))?;
    listener
        .set_reuse_address(true)
        .map_err(|e| Error::socket("setsockopt(SO_REUSEADDR)", e))?;
    listener
        .bind(&SockAddr::from(addr))
        .map_err(|e| Error::socket("bind", e))?;
    listener
        .listen(libc::SOMAXCONN)
        .map_err(|e| Error::socket("listen", e))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| Error::socket("set_nonblocking", e))?;

    tracing::debug!(%addr, "listening socket ready");
    Ok(listener)
}

/// The bound address, resolving port 0 to the ephemeral port.
pub fn local_addr(listener: &Socket) -> Option<SocketAddr> {
    listener.local_addr().ok().and_then(|a| a.as_socket())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    #[test]
    fn test_bind_ephemeral() {
        let config = RootConfig::new().address("").port(0);
        let listener = bind(&config).unwrap();
        let addr = local_addr(&listener).unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);

        let _client = TcpStream::connect(addr).unwrap();
        // non-blocking accept sees the pending connection eventually
        let mut accepted = None;
        for _ in 0..100 {
            match listener.accept() {
                Ok(conn) => {
                    accepted = Some(conn);
                    break;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        assert!(accepted.is_some());
    }

    #[test]
    fn test_accept_would_block() {
        let listener = bind(&RootConfig::new().port(0)).unwrap();
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_bind_bad_address() {
        let config = RootConfig::new().address("not-an-ip").port(0);
        assert!(matches!(bind(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_bind_in_use() {
        let first = bind(&RootConfig::new().port(0)).unwrap();
        let port = local_addr(&first).unwrap().port();
        // SO_REUSEADDR does not allow two listeners on one port
        let second = bind(&RootConfig::new().port(port));
        assert!(matches!(second, Err(Error::Socket { op: "bind", .. })));
    }
}
