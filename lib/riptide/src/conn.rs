use crate::buffer::Buffer;
use crate::event::Handler;
use crate::mqtt::MqttOpts;
use crate::sock::Sock;
use crate::tls::{TlsHooks, TlsOpts};
use keel::logging;
use keel::{ErrorKind, NetError, NetResult};
use std::any::Any;
use std::net::SocketAddr;

/// Application protocol driven on a connection. Listeners stamp their
/// protocol onto accepted children; `ws`/`wss` clients start as `Http`
/// until the upgrade handshake completes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Proto {
    Raw,
    Http,
    Ws,
    Mqtt,
    Sntp,
    /// Internal loopback endpoint of the wakeup channel.
    Wakeup,
}

/// In-flight client-side WebSocket handshake state.
pub(crate) struct WsClientHs {
    pub key: String,
    pub host: String,
    pub uri: String,
}

/// A single endpoint owned by the manager: one socket (or virtual
/// endpoint), its paired receive/send buffers, state flags, and the event
/// handler reference.
pub struct Connection {
    id: u64,
    pub(crate) sock: Sock,
    pub(crate) local: Option<SocketAddr>,
    pub(crate) remote: Option<SocketAddr>,

    pub recv: Buffer,
    pub send: Buffer,

    // State flags. All driver-managed except `draining`/`closing`, which
    // the application sets through `drain()`/`close()`.
    pub listening: bool,
    pub client: bool,
    pub accepted: bool,
    pub resolving: bool,
    pub connecting: bool,
    pub tls: bool,
    pub tls_hs: bool,
    pub udp: bool,
    pub websocket: bool,
    pub draining: bool,
    pub closing: bool,
    pub full: bool,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    pub resp: bool,

    pub userdata: Option<Box<dyn Any>>,

    pub(crate) handler: Option<Handler>,
    pub(crate) proto: Proto,

    pub(crate) tls_hooks: Option<Box<dyn TlsHooks>>,
    pub(crate) tls_opts: Option<TlsOpts>,
    /// Ciphertext staging for TLS connections; socket reads land here and
    /// the hooks recover plaintext into `recv`.
    pub(crate) tls_in: Option<Buffer>,

    // Per-protocol parser state.
    pub(crate) hdrs_emitted: bool,
    pub(crate) ws_frag: Vec<u8>,
    pub(crate) ws_frag_opcode: Option<u8>,
    pub(crate) ws_open_pending: bool,
    pub(crate) ws_ctl_consumed: bool,
    pub(crate) ws_client_hs: Option<WsClientHs>,
    pub(crate) mqtt_next_id: u16,
    pub(crate) mqtt_opts: Option<MqttOpts>,

    /// Deferred error message; the driver dispatches it as ERROR before
    /// closing.
    pub(crate) pending_error: Option<String>,
    pub(crate) eof: bool,

    pub(crate) log: logging::Logger,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        sock: Sock,
        proto: Proto,
        recv_size: usize,
        hard_cap: usize,
        log: logging::Logger,
    ) -> Connection {
        let local = sock.local_addr();
        let remote = sock.peer_addr();

        Connection {
            id,
            sock,
            local,
            remote,
            recv: Buffer::new(recv_size, hard_cap),
            send: Buffer::new(recv_size, hard_cap),
            listening: false,
            client: false,
            accepted: false,
            resolving: false,
            connecting: false,
            tls: false,
            tls_hs: false,
            udp: false,
            websocket: false,
            draining: false,
            closing: false,
            full: false,
            readable: false,
            writable: false,
            resp: false,
            userdata: None,
            handler: None,
            proto,
            tls_hooks: None,
            tls_opts: None,
            tls_in: None,
            hdrs_emitted: false,
            ws_frag: Vec::new(),
            ws_frag_opcode: None,
            ws_open_pending: false,
            ws_ctl_consumed: false,
            ws_client_hs: None,
            mqtt_next_id: 0,
            mqtt_opts: None,
            pending_error: None,
            eof: false,
            log,
        }
    }

    /// Endpoint without an underlying socket, used for tests and internal
    /// plumbing.
    pub(crate) fn virtual_endpoint(id: u64, proto: Proto, log: logging::Logger) -> Connection {
        Connection::new(id, Sock::Closed, proto, 2048, 1 << 22, log)
    }

    /// Stable identifier, unique within the owning manager. The only piece
    /// of connection identity that may be shared with other threads.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    #[inline]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Installs a per-connection handler, overriding the manager default.
    pub fn set_handler<H: crate::event::EventHandler + 'static>(&mut self, handler: H) {
        self.handler = Some(crate::event::handler_slot(handler));
    }

    /// Enqueues bytes on the send buffer, the single serialization point
    /// for outbound data. TLS connections encrypt on enqueue so the send
    /// buffer always holds wire-ready bytes.
    pub fn send_bytes(&mut self, bytes: &[u8]) -> NetResult<()> {
        if self.closing {
            return Err(NetError::Fatal(ErrorKind::Usage("send on closing connection")));
        }

        if self.tls && !self.tls_hs {
            let ciphertext = match self.tls_hooks.as_mut() {
                Some(hooks) => hooks.write(bytes)?,
                None => return Err(NetError::Fatal(ErrorKind::Tls("tls hooks missing"))),
            };
            return self.enqueue(&ciphertext);
        }

        self.enqueue(bytes)
    }

    pub(crate) fn enqueue(&mut self, bytes: &[u8]) -> NetResult<()> {
        if !self.send.append(bytes) {
            self.fail(ErrorKind::Resource("send buffer ceiling exceeded"));
            return Err(NetError::Fatal(ErrorKind::Resource(
                "send buffer ceiling exceeded",
            )));
        }

        Ok(())
    }

    /// Graceful close: stop reading, flush the send buffer, then close.
    #[inline]
    pub fn drain(&mut self) {
        self.draining = true;
    }

    /// Hard close; the entry is dropped on the next dispatcher pass.
    #[inline]
    pub fn close(&mut self) {
        self.closing = true;
    }

    /// Marks the connection failed: the driver will dispatch ERROR and
    /// close. Parse failures drain (flush what is queued) instead of
    /// dropping the socket outright.
    pub(crate) fn fail(&mut self, kind: ErrorKind) {
        logging::debug!(self.log, "connection failed";
                        "conn_id" => self.id,
                        "error" => %kind);

        if self.pending_error.is_none() {
            self.pending_error = Some(kind.to_string());
        }

        match kind {
            ErrorKind::Parse(_) => self.draining = true,
            _ => self.closing = true,
        }
    }

    /// Consumes the WS_CTL in-flight control frame, suppressing the
    /// automatic PONG/close response for it. Only meaningful while handling
    /// a WS_CTL event.
    #[inline]
    pub fn ws_ctl_consume(&mut self) {
        self.ws_ctl_consumed = true;
    }

    /// Applies the backpressure watermarks: `full` raises at the high
    /// water mark and clears once the buffer drops below half of it.
    pub(crate) fn update_watermark(&mut self, high_water: usize) {
        if self.recv.len() >= high_water {
            if !self.full {
                logging::debug!(self.log, "recv high water reached";
                                "conn_id" => self.id,
                                "len" => self.recv.len());
            }
            self.full = true;
        } else if self.full && self.recv.len() < high_water / 2 {
            self.full = false;
        }
    }

    /// Shuts the endpoint down: TLS teardown hook, socket release, buffer
    /// wipe. Called exactly once by the driver after CLOSE was dispatched.
    pub(crate) fn destroy(&mut self) {
        logging::debug!(self.log, "closing connection";
                        "conn_id" => self.id,
                        "recv_len" => self.recv.len(),
                        "send_len" => self.send.len());

        if let Some(mut hooks) = self.tls_hooks.take() {
            hooks.free();
        }

        self.sock = Sock::Closed;
        self.recv.clear();
        self.send.clear();
        self.handler = None;
        self.userdata = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::testing::PlainHooks;

    fn test_conn() -> Connection {
        Connection::virtual_endpoint(1, Proto::Raw, keel::logging::discard())
    }

    #[test]
    fn test_send_bytes_lands_in_send_buffer() {
        let mut conn = test_conn();

        conn.send_bytes(b"abc").unwrap();
        conn.send_bytes(b"def").unwrap();

        assert_eq!(conn.send.read_slice(), b"abcdef");
    }

    #[test]
    fn test_send_refused_when_closing() {
        let mut conn = test_conn();
        conn.close();

        assert_eq!(
            conn.send_bytes(b"abc").unwrap_err(),
            NetError::Fatal(ErrorKind::Usage("send on closing connection"))
        );
    }

    #[test]
    fn test_parse_failure_drains_socket_failure_closes() {
        let mut conn = test_conn();
        conn.fail(ErrorKind::Parse("bad frame"));
        assert!(conn.draining);
        assert!(!conn.closing);
        assert!(conn.pending_error.is_some());

        let mut conn = test_conn();
        conn.fail(ErrorKind::Socket(std::io::ErrorKind::ConnectionReset));
        assert!(conn.closing);
    }

    #[test]
    fn test_watermark_hysteresis() {
        let mut conn = test_conn();

        assert!(conn.recv.append(&[0u8; 100]));
        conn.update_watermark(100);
        assert!(conn.full);

        // Dropping below high water but above low water keeps `full` up.
        conn.recv.consume(30);
        conn.update_watermark(100);
        assert!(conn.full);

        // Below the low water mark (high / 2) the flag clears.
        conn.recv.consume(25);
        conn.update_watermark(100);
        assert!(!conn.full);
    }

    #[test]
    fn test_tls_send_encrypts_on_enqueue() {
        let mut conn = test_conn();
        conn.tls = true;
        conn.tls_hooks = Some(Box::new(PlainHooks::new()));

        conn.send_bytes(b"plain").unwrap();
        assert_eq!(conn.send.read_slice(), b"plain");
    }

    #[test]
    fn test_destroy_frees_tls_and_buffers() {
        let mut conn = test_conn();
        conn.tls = true;
        conn.tls_hooks = Some(Box::new(PlainHooks::new()));
        conn.send_bytes(b"bytes").unwrap();

        conn.destroy();

        assert!(conn.send.is_empty());
        assert!(conn.tls_hooks.is_none());
    }
}
