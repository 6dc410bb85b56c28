use keel::{ErrorKind, NetError, NetResult};
use mio::net::{TcpListener, TcpStream, UdpSocket, UnixStream};
use mio::{Interest, Registry, Token};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// The socket (or loopback pseudo-socket) behind a connection. Virtual
/// endpoints such as the wakeup channel reuse the same adapter so the I/O
/// driver treats every connection uniformly.
pub enum Sock {
    Tcp(TcpStream),
    Listener(TcpListener),
    Udp(UdpSocket),
    Pipe(UnixStream),
    /// Endpoint without an underlying socket (already closed or virtual).
    Closed,
}

impl Sock {
    #[inline]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Sock::Tcp(stream) => stream.local_addr().ok(),
            Sock::Listener(listener) => listener.local_addr().ok(),
            Sock::Udp(socket) => socket.local_addr().ok(),
            _ => None,
        }
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Sock::Tcp(stream) => stream.peer_addr().ok(),
            Sock::Udp(socket) => socket.peer_addr().ok(),
            _ => None,
        }
    }

    /// Registers the socket for readiness notification under the supplied
    /// token. Virtual endpoints register nothing and succeed.
    pub fn register(&mut self, registry: &Registry, token: Token) -> NetResult<()> {
        let interest = Interest::READABLE | Interest::WRITABLE;

        match self {
            Sock::Tcp(stream) => registry.register(stream, token, interest)?,
            Sock::Listener(listener) => registry.register(listener, token, Interest::READABLE)?,
            Sock::Udp(socket) => registry.register(socket, token, interest)?,
            Sock::Pipe(stream) => registry.register(stream, token, Interest::READABLE)?,
            Sock::Closed => (),
        }

        Ok(())
    }

    pub fn deregister(&mut self, registry: &Registry) {
        // Deregistration failures are ignored; the fd is about to close.
        let _ = match self {
            Sock::Tcp(stream) => registry.deregister(stream),
            Sock::Listener(listener) => registry.deregister(listener),
            Sock::Udp(socket) => registry.deregister(socket),
            Sock::Pipe(stream) => registry.deregister(stream),
            Sock::Closed => Ok(()),
        };
    }

    /// Checks a pending non-blocking connect for completion. `Ok(true)`
    /// means the handshake finished, `Ok(false)` that it is still in
    /// flight.
    pub fn connect_finished(&self) -> NetResult<bool> {
        match self {
            Sock::Tcp(stream) => match stream.take_error() {
                Ok(Some(err)) | Err(err) => Err(err.into()),
                Ok(None) => match stream.peer_addr() {
                    Ok(_) => Ok(true),
                    Err(ref err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
                    Err(err) => Err(err.into()),
                },
            },
            _ => Ok(true),
        }
    }
}

/// Opens a non-blocking TCP listener bound to `addr`.
pub fn listen_tcp(addr: SocketAddr) -> NetResult<TcpListener> {
    TcpListener::bind(addr).map_err(Into::into)
}

/// Opens a non-blocking UDP socket bound to `addr`.
pub fn listen_udp(addr: SocketAddr) -> NetResult<UdpSocket> {
    UdpSocket::bind(addr).map_err(Into::into)
}

/// Starts a non-blocking TCP connect.
pub fn connect_tcp(addr: SocketAddr) -> NetResult<TcpStream> {
    TcpStream::connect(addr).map_err(Into::into)
}

/// Opens a UDP socket "connected" to the peer so plain send/recv apply.
pub fn connect_udp(addr: SocketAddr) -> NetResult<UdpSocket> {
    let bind: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };

    let socket = UdpSocket::bind(bind)?;
    socket.connect(addr)?;
    Ok(socket)
}

/// Resolves `host:port` to a socket address. IP literals resolve without a
/// lookup; names go through the system resolver.
pub fn resolve(host: &str, port: u16) -> NetResult<SocketAddr> {
    if let Ok(ip) = host.parse() {
        return Ok(SocketAddr::new(ip, port));
    }

    (host, port)
        .to_socket_addrs()
        .map_err(NetError::from)?
        .next()
        .ok_or(NetError::Fatal(ErrorKind::Socket(io::ErrorKind::NotFound)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ip_literal_skips_lookup() {
        let addr = resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());

        let addr = resolve("::1", 443).unwrap();
        assert_eq!(addr, "[::1]:443".parse().unwrap());
    }

    #[test]
    fn test_listener_binds_ephemeral() {
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
    }
}
