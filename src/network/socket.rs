//! TCP socket setup tuned for low latency

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::NetworkError;

/// Bind the server listener.
///
/// The listener is non-blocking so the accept loop can notice shutdown.
pub fn bind_listener(addr: SocketAddr, recv_buffer: usize) -> Result<TcpListener, NetworkError> {
    let bind_err = |e: io::Error| NetworkError::BindFailed(format!("{}: {}", addr, e));

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_recv_buffer_size(recv_buffer).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    // one session at a time
    socket.listen(1).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    Ok(socket.into())
}

/// Configure an accepted connection for streaming
pub fn tune_accepted(stream: &TcpStream, recv_buffer: usize) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_recv_buffer_size(recv_buffer)
}

/// Resolve `host:port`, preferring the first address returned
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| NetworkError::ConnectionFailed(format!("could not resolve '{}': {}", host, e)))?
        .next()
        .ok_or_else(|| NetworkError::ConnectionFailed(format!("no address for '{}'", host)))
}

/// Connect to the relay server with Nagle disabled and a small send buffer
pub fn connect(addr: SocketAddr, timeout: Duration, send_buffer: usize) -> Result<TcpStream, NetworkError> {
    let connect_err = |e: io::Error| NetworkError::ConnectionFailed(format!("{}: {}", addr, e));

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(connect_err)?;
    socket.set_nodelay(true).map_err(connect_err)?;
    socket.set_send_buffer_size(send_buffer).map_err(connect_err)?;
    socket.connect_timeout(&addr.into(), timeout).map_err(connect_err)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_to_bound_listener() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), 8192).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = connect(addr, Duration::from_secs(2), 8192).unwrap();
        assert!(client.nodelay().unwrap());

        // non-blocking accept may need a moment
        let stream = loop {
            match listener.accept() {
                Ok((stream, _)) => break stream,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(5))
                }
                Err(e) => panic!("accept failed: {}", e),
            }
        };
        tune_accepted(&stream, 8192).unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[test]
    fn test_connect_refused() {
        // grab a free port, then close it
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let result = connect(addr, Duration::from_secs(1), 8192);
        assert!(matches!(result, Err(NetworkError::ConnectionFailed(_))));
    }

    #[test]
    fn test_resolve_localhost() {
        let addr = resolve("localhost", 5000).unwrap();
        assert_eq!(addr.port(), 5000);
        assert!(addr.ip().is_loopback());
    }
}
