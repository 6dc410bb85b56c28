use crate::buffer::Buffer;
use crate::conn::{Connection, Proto, WsClientHs};
use crate::event::{dispatch, handler_slot, Event, EventHandler, Handler};
use crate::http::parse as http_parse;
use crate::http::parse::HttpProgress;
use crate::mqtt::{self, MqttOpts};
use crate::sntp;
use crate::sock::{self, Sock};
use crate::timer::{TimerId, TimerWheel};
use crate::tls::{HsStatus, TlsHooks, TlsOpts};
use crate::url::{Scheme, Url};
use crate::wake::{self, WakeupSender};
use crate::ws::{self, WsDeliver, WsProgress};
use indexmap::IndexMap;
use keel::logging;
use keel::{ErrorKind, NetError, NetResult};
use mio::{Events, Poll, Token};
use std::io;
use std::time::{Duration, Instant};

/// Tunables for one manager instance.
pub struct ManagerOpts {
    /// Initial size of each connection's recv/send buffer.
    pub recv_buf_size: usize,
    /// Backpressure threshold: reads stop while a recv buffer holds this
    /// much unconsumed data, until it drains below half of it.
    pub recv_high_water: usize,
    /// Hard growth ceiling per buffer; exceeding it is a resource error.
    pub recv_hard_cap: usize,
    /// Largest accepted WebSocket frame payload.
    pub max_ws_frame: usize,
    /// Largest accepted MQTT remaining length.
    pub max_mqtt_len: usize,
    /// Create the cross-thread wakeup channel at init.
    pub enable_wakeup: bool,
    /// Root logger; defaults to discard.
    pub log: Option<logging::Logger>,
}

impl Default for ManagerOpts {
    fn default() -> ManagerOpts {
        ManagerOpts {
            recv_buf_size: 16 * 1024,
            recv_high_water: 2 * 1024 * 1024,
            recv_hard_cap: 4 * 1024 * 1024,
            max_ws_frame: 1024 * 1024,
            max_mqtt_len: 1024 * 1024,
            enable_wakeup: false,
            log: None,
        }
    }
}

type TlsProvider = Box<dyn Fn(&TlsOpts) -> Box<dyn TlsHooks>>;

/// Root container for one cooperative loop: the ordered connection table,
/// the readiness poller, the timer wheel and the wakeup channel. All
/// operations except `WakeupSender::wakeup` must happen on the thread that
/// calls `poll`.
pub struct Manager {
    opts: ManagerOpts,
    log: logging::Logger,
    poll: Poll,
    events: Events,
    conns: IndexMap<u64, Connection>,
    next_id: u64,
    timers: TimerWheel,
    default_handler: Option<Handler>,
    tls_provider: Option<TlsProvider>,
    wakeup_id: Option<u64>,
    wakeup_tx: Option<WakeupSender>,
}

impl Manager {
    pub fn new(opts: ManagerOpts) -> NetResult<Manager> {
        let log = opts.log.clone().unwrap_or_else(logging::discard);

        let mut mgr = Manager {
            opts,
            timers: TimerWheel::new(log.clone()),
            log,
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            conns: IndexMap::new(),
            next_id: 0,
            default_handler: None,
            tls_provider: None,
            wakeup_id: None,
            wakeup_tx: None,
        };

        if mgr.opts.enable_wakeup {
            let (reader, sender) = wake::channel()?;
            let id = mgr.alloc_id();
            let mut conn = mgr.make_conn(id, Sock::Pipe(reader), Proto::Wakeup);
            conn.sock.register(mgr.poll.registry(), Token(id as usize))?;
            mgr.conns.insert(id, conn);
            mgr.wakeup_id = Some(id);
            mgr.wakeup_tx = Some(sender);
        }

        Ok(mgr)
    }

    /// Installs the fallback handler used by connections without one of
    /// their own.
    pub fn set_default_handler<H: EventHandler + 'static>(&mut self, handler: H) {
        self.default_handler = Some(handler_slot(handler));
    }

    /// Installs the TLS strategy used for `https`/`wss`/`mqtts` endpoints.
    pub fn set_tls_provider<F>(&mut self, provider: F)
    where
        F: Fn(&TlsOpts) -> Box<dyn TlsHooks> + 'static,
    {
        self.tls_provider = Some(Box::new(provider));
    }

    #[inline]
    pub fn conn(&self, id: u64) -> Option<&Connection> {
        self.conns.get(&id)
    }

    #[inline]
    pub fn conn_mut(&mut self, id: u64) -> Option<&mut Connection> {
        self.conns.get_mut(&id)
    }

    /// Cloneable cross-thread wakeup producer; present when the manager
    /// was created with `enable_wakeup`.
    pub fn wakeup_sender(&self) -> Option<WakeupSender> {
        self.wakeup_tx.clone()
    }

    /// Queues a WAKEUP event for connection `id` from the loop thread
    /// itself.
    pub fn wakeup(&self, id: u64, payload: &[u8]) -> NetResult<()> {
        self.wakeup_tx
            .as_ref()
            .ok_or(NetError::Fatal(ErrorKind::Usage("wakeup channel not enabled")))?
            .wakeup(id, payload)
    }

    pub fn timer_add<F: FnMut() + 'static>(
        &mut self,
        period_ms: u64,
        flags: u8,
        callback: F,
    ) -> TimerId {
        self.timers.add(period_ms, flags, callback)
    }

    pub fn timer_del(&mut self, id: TimerId) {
        self.timers.del(id);
    }

    /// Dispatches an application-defined USER event to a connection.
    pub fn fire_user(&mut self, id: u64, payload: &[u8]) {
        self.dispatch_to(id, Event::User(payload));
    }

    /// Opens a listening endpoint. The scheme selects the protocol driver
    /// for accepted connections; `tls` engages the TLS strategy on them.
    pub fn listen(&mut self, url: &str, tls: Option<TlsOpts>) -> NetResult<u64> {
        let parsed = Url::parse(url)?;
        let addr = sock::resolve(&parsed.host, parsed.port)?;

        if tls.is_some() && self.tls_provider.is_none() {
            return Err(NetError::Fatal(ErrorKind::Usage("tls provider not installed")));
        }

        let id = self.alloc_id();
        let sock = if parsed.scheme.is_udp() {
            Sock::Udp(sock::listen_udp(addr)?)
        } else {
            Sock::Listener(sock::listen_tcp(addr)?)
        };

        let mut conn = self.make_conn(id, sock, proto_for(parsed.scheme));
        conn.listening = true;
        conn.udp = parsed.scheme.is_udp();
        conn.tls_opts = tls;
        conn.sock.register(self.poll.registry(), Token(id as usize))?;

        logging::debug!(self.log, "listener opened";
                        "conn_id" => id,
                        "url" => url,
                        "addr" => %addr);

        self.conns.insert(id, conn);
        self.dispatch_to(id, Event::Open);
        Ok(id)
    }

    /// MQTT broker-side listener; equivalent to `listen` with an
    /// `mqtt://` url.
    pub fn mqtt_listen(&mut self, url: &str, tls: Option<TlsOpts>) -> NetResult<u64> {
        self.listen(url, tls)
    }

    /// Opens an outbound connection. Hostname resolution happens behind
    /// the RESOLVE event point; resolution or socket failures after the
    /// connection is inserted surface as ERROR then CLOSE.
    pub fn connect(&mut self, url: &str, tls: Option<TlsOpts>) -> NetResult<u64> {
        self.connect_inner(url, tls, None, false)
    }

    /// Opens an MQTT client connection. The CONNECT packet is emitted once
    /// the transport (and TLS handshake, if any) is up; CONNACK surfaces
    /// as MQTT_OPEN.
    pub fn mqtt_connect(
        &mut self,
        url: &str,
        opts: MqttOpts,
        tls: Option<TlsOpts>,
    ) -> NetResult<u64> {
        self.connect_inner(url, tls, Some(opts), false)
    }

    /// Opens a WebSocket client connection: the upgrade request is sent on
    /// connect and WS_OPEN fires once the 101 response validates.
    pub fn ws_connect(&mut self, url: &str, tls: Option<TlsOpts>) -> NetResult<u64> {
        self.connect_inner(url, tls, None, true)
    }

    /// Starts an SNTP exchange; the reply surfaces as SNTP_TIME with epoch
    /// milliseconds.
    pub fn sntp_connect(&mut self, url: &str) -> NetResult<u64> {
        let parsed = Url::parse(url)?;
        if !parsed.scheme.is_udp() {
            return Err(NetError::Fatal(ErrorKind::Usage("sntp requires a udp:// url")));
        }

        let id = self.connect_inner(url, None, None, false)?;
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.proto = Proto::Sntp;
            let request = sntp::request();
            let _ = conn.send_bytes(&request);
        }
        Ok(id)
    }

    fn connect_inner(
        &mut self,
        url: &str,
        tls: Option<TlsOpts>,
        mqtt_opts: Option<MqttOpts>,
        ws_client: bool,
    ) -> NetResult<u64> {
        let parsed = Url::parse(url)?;

        if (tls.is_some() || parsed.scheme.is_tls()) && self.tls_provider.is_none() {
            return Err(NetError::Fatal(ErrorKind::Usage("tls provider not installed")));
        }

        let id = self.alloc_id();
        let mut conn = self.make_conn(id, Sock::Closed, proto_for(parsed.scheme));
        conn.client = true;
        conn.udp = parsed.scheme.is_udp();
        conn.resolving = true;
        conn.mqtt_opts = mqtt_opts;

        if ws_client {
            conn.ws_client_hs = Some(WsClientHs {
                key: ws::client_key(),
                host: parsed.host.clone(),
                uri: parsed.uri.clone(),
            });
        }

        self.conns.insert(id, conn);
        self.dispatch_to(id, Event::Open);

        // Synchronous resolution behind the RESOLVE event point.
        let addr = match sock::resolve(&parsed.host, parsed.port) {
            Ok(addr) => addr,
            Err(err) => {
                self.conn_fail(id, ErrorKind::Socket(io::ErrorKind::NotFound));
                logging::debug!(self.log, "resolution failed"; "conn_id" => id, "url" => url, "error" => ?err);
                return Ok(id);
            }
        };

        let setup = self.finish_connect_setup(id, parsed, addr, tls);
        if let Err(err) = setup {
            let kind = match err {
                NetError::Fatal(kind) => kind,
                NetError::Wait => ErrorKind::Socket(io::ErrorKind::WouldBlock),
            };
            self.conn_fail(id, kind);
        }

        Ok(id)
    }

    fn finish_connect_setup(
        &mut self,
        id: u64,
        parsed: Url,
        addr: std::net::SocketAddr,
        tls: Option<TlsOpts>,
    ) -> NetResult<()> {
        let engage_tls = tls.is_some() || parsed.scheme.is_tls();
        let hooks = if engage_tls {
            let mut opts = tls.unwrap_or_default();
            if opts.name.is_none() {
                opts.name = Some(parsed.host.clone());
            }

            let provider = self
                .tls_provider
                .as_ref()
                .ok_or(NetError::Fatal(ErrorKind::Usage("tls provider not installed")))?;
            let mut hooks = provider(&opts);
            hooks.init(&opts)?;
            Some((hooks, opts))
        } else {
            None
        };

        let conn = self
            .conns
            .get_mut(&id)
            .ok_or(NetError::Fatal(ErrorKind::Usage("connection vanished")))?;

        conn.resolving = false;

        if parsed.scheme.is_udp() {
            conn.sock = Sock::Udp(sock::connect_udp(addr)?);
        } else {
            conn.sock = Sock::Tcp(sock::connect_tcp(addr)?);
            conn.connecting = true;
        }

        conn.local = conn.sock.local_addr();
        conn.remote = Some(addr);

        if let Some((hooks, opts)) = hooks {
            conn.tls = true;
            conn.tls_hs = true;
            conn.tls_hooks = Some(hooks);
            conn.tls_in = Some(Buffer::new(self.opts.recv_buf_size, self.opts.recv_hard_cap));
            conn.tls_opts = Some(opts);
        }

        if let Some(conn) = self.conns.get_mut(&id) {
            conn.sock.register(self.poll.registry(), Token(id as usize))?;
        }

        self.dispatch_to(id, Event::Resolve);

        // Connected datagram sockets have no handshake to wait for.
        if let Some(conn) = self.conns.get_mut(&id) {
            if conn.udp {
                self.dispatch_to(id, Event::Connect);
                self.transport_ready(id);
            }
        }

        Ok(())
    }

    /// Drives one poll cycle: readiness, accepts, connects, reads, parser
    /// dispatch, writes, timers, wakeups, POLL events, and the close sweep.
    /// The only suspension point in the runtime; returns after at most
    /// `timeout_ms` regardless of activity.
    pub fn poll(&mut self, timeout_ms: u64) -> NetResult<()> {
        let timeout = Duration::from_millis(timeout_ms);

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => (),
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => (),
            Err(err) => return Err(err.into()),
        }

        for event in self.events.iter() {
            let id = event.token().0 as u64;
            if let Some(conn) = self.conns.get_mut(&id) {
                if event.is_readable() {
                    conn.readable = true;
                }
                if event.is_writable() {
                    conn.writable = true;
                }
                if event.is_error() {
                    // Failed connects and socket errors surface through the
                    // read/write paths, which must both run.
                    conn.readable = true;
                    conn.writable = true;
                }
            }
        }

        let now = Instant::now();

        let ids: Vec<u64> = self.conns.keys().copied().collect();
        for id in ids {
            self.service_conn(id);
        }

        self.timers.tick(now);
        self.drain_wakeup();

        let ids: Vec<u64> = self.conns.keys().copied().collect();
        for id in ids {
            let skip = match self.conns.get(&id) {
                Some(conn) => conn.proto == Proto::Wakeup || conn.closing,
                None => true,
            };
            if !skip {
                self.dispatch_to(id, Event::Poll);
            }
        }

        self.sweep();
        Ok(())
    }

    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn make_conn(&self, id: u64, sock: Sock, proto: Proto) -> Connection {
        Connection::new(
            id,
            sock,
            proto,
            self.opts.recv_buf_size,
            self.opts.recv_hard_cap,
            self.log.new(logging::o!("conn" => id)),
        )
    }

    fn dispatch_to(&mut self, id: u64, event: Event<'_>) {
        if let Some(conn) = self.conns.get_mut(&id) {
            dispatch(conn, self.default_handler.as_ref(), &self.log, event);
        }
    }

    /// Marks a connection failed and emits ERROR. Parse failures drain;
    /// everything else closes outright.
    fn conn_fail(&mut self, id: u64, kind: ErrorKind) {
        if let Some(conn) = self.conns.get_mut(&id) {
            conn.fail(kind);
        }
        self.flush_error(id);
    }

    fn flush_error(&mut self, id: u64) {
        let message = match self.conns.get_mut(&id) {
            Some(conn) => conn.pending_error.take(),
            None => None,
        };

        if let Some(message) = message {
            self.dispatch_to(id, Event::Error(&message));
        }
    }

    fn service_conn(&mut self, id: u64) {
        let (listening, udp, connecting, closing) = match self.conns.get(&id) {
            Some(conn) => (conn.listening, conn.udp, conn.connecting, conn.closing),
            None => return,
        };

        if closing {
            return;
        }

        if listening && !udp {
            self.accept_ready(id);
            return;
        }

        if connecting {
            self.finish_connect(id);
        }

        self.drive_tls_handshake(id);
        self.read_phase(id);
        self.write_phase(id);
    }

    fn accept_ready(&mut self, listener_id: u64) {
        let (ready, proto, handler, tls_opts) = match self.conns.get(&listener_id) {
            Some(listener) => (
                listener.readable,
                listener.proto,
                listener.handler.clone(),
                listener.tls_opts.clone(),
            ),
            None => return,
        };

        if !ready {
            return;
        }

        loop {
            let accepted = match self.conns.get_mut(&listener_id) {
                Some(listener) => match &mut listener.sock {
                    Sock::Listener(sock) => sock.accept(),
                    _ => return,
                },
                None => return,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let id = self.alloc_id();
                    let mut conn = self.make_conn(id, Sock::Tcp(stream), proto);
                    conn.accepted = true;
                    conn.remote = Some(peer);
                    conn.handler = handler.clone();

                    if let Some(opts) = &tls_opts {
                        if let Err(err) = self.engage_tls(&mut conn, opts.clone()) {
                            logging::warn!(self.log, "tls engage failed on accept";
                                           "listener" => listener_id,
                                           "error" => ?err);
                            continue;
                        }
                    }

                    if let Err(err) = conn.sock.register(self.poll.registry(), Token(id as usize)) {
                        logging::warn!(self.log, "register failed on accept";
                                       "listener" => listener_id,
                                       "error" => ?err);
                        continue;
                    }

                    logging::debug!(self.log, "connection accepted";
                                    "listener" => listener_id,
                                    "conn_id" => id,
                                    "peer" => %peer);

                    self.conns.insert(id, conn);
                    self.dispatch_to(id, Event::Open);
                    self.dispatch_to(id, Event::Accept);
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if let Some(listener) = self.conns.get_mut(&listener_id) {
                        listener.readable = false;
                    }
                    return;
                }
                Err(err) => {
                    logging::warn!(self.log, "accept failed";
                                   "listener" => listener_id,
                                   "error" => ?err);
                    return;
                }
            }
        }
    }

    fn engage_tls(&self, conn: &mut Connection, opts: TlsOpts) -> NetResult<()> {
        let provider = self
            .tls_provider
            .as_ref()
            .ok_or(NetError::Fatal(ErrorKind::Usage("tls provider not installed")))?;

        let mut hooks = provider(&opts);
        hooks.init(&opts)?;

        conn.tls = true;
        conn.tls_hs = true;
        conn.tls_hooks = Some(hooks);
        conn.tls_in = Some(Buffer::new(self.opts.recv_buf_size, self.opts.recv_hard_cap));
        conn.tls_opts = Some(opts);
        Ok(())
    }

    fn finish_connect(&mut self, id: u64) {
        let finished = match self.conns.get_mut(&id) {
            Some(conn) => {
                if !conn.writable {
                    return;
                }
                conn.sock.connect_finished()
            }
            None => return,
        };

        match finished {
            Ok(true) => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.connecting = false;
                    conn.local = conn.sock.local_addr();
                }
                self.dispatch_to(id, Event::Connect);

                let tls_pending = self
                    .conns
                    .get(&id)
                    .map(|conn| conn.tls_hs)
                    .unwrap_or(false);
                if !tls_pending {
                    self.transport_ready(id);
                }
            }
            Ok(false) => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.writable = false;
                }
            }
            Err(err) => {
                let kind = match err {
                    NetError::Fatal(kind) => kind,
                    NetError::Wait => return,
                };
                self.conn_fail(id, kind);
            }
        }
    }

    /// Runs once the byte pipe to the peer is usable (TCP established and
    /// TLS handshake, when present, completed): protocol-level hellos go
    /// out here.
    fn transport_ready(&mut self, id: u64) {
        enum Hello {
            Mqtt(Vec<u8>),
            Ws(String),
            None,
        }

        let hello = match self.conns.get_mut(&id) {
            Some(conn) => {
                if conn.proto == Proto::Mqtt && conn.client {
                    match &conn.mqtt_opts {
                        Some(opts) => Hello::Mqtt(mqtt::pack_connect(opts)),
                        None => Hello::None,
                    }
                } else if let Some(hs) = &conn.ws_client_hs {
                    Hello::Ws(format!(
                        "GET {} HTTP/1.1\r\n\
                         Host: {}\r\n\
                         Upgrade: websocket\r\n\
                         Connection: Upgrade\r\n\
                         Sec-WebSocket-Key: {}\r\n\
                         Sec-WebSocket-Version: 13\r\n\r\n",
                        hs.uri, hs.host, hs.key
                    ))
                } else {
                    Hello::None
                }
            }
            None => return,
        };

        if let Some(conn) = self.conns.get_mut(&id) {
            let result = match hello {
                Hello::Mqtt(packet) => conn.send_bytes(&packet),
                Hello::Ws(request) => {
                    conn.resp = true;
                    conn.send_bytes(request.as_bytes())
                }
                Hello::None => {
                    if conn.proto == Proto::Http && conn.client {
                        conn.resp = true;
                    }
                    Ok(())
                }
            };

            if result.is_err() {
                self.flush_error(id);
            }
        }
    }

    fn drive_tls_handshake(&mut self, id: u64) {
        let pending = match self.conns.get(&id) {
            Some(conn) => conn.tls_hs && !conn.connecting,
            None => return,
        };

        if !pending {
            return;
        }

        // Pull ciphertext off the socket first so the strategy has bytes
        // to chew on.
        let mut fail: Option<ErrorKind> = None;

        if let Some(conn) = self.conns.get_mut(&id) {
            if conn.readable {
                let mut staging = conn.tls_in.take().unwrap_or_else(|| Buffer::new(2048, 1 << 20));
                let result = match &mut conn.sock {
                    Sock::Tcp(stream) => staging.ingress(&mut *stream),
                    _ => Ok(0),
                };
                conn.tls_in = Some(staging);

                match result {
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                        conn.readable = false
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                        conn.eof = true
                    }
                    Err(err) => fail = Some(ErrorKind::Socket(err.kind())),
                    Ok(_) => (),
                }
            }
        }

        if let Some(kind) = fail {
            self.conn_fail(id, kind);
            return;
        }

        let status = match self.conns.get_mut(&id) {
            Some(conn) => {
                let mut hooks = match conn.tls_hooks.take() {
                    Some(hooks) => hooks,
                    None => return,
                };
                let mut staging = conn.tls_in.take().unwrap_or_else(|| Buffer::new(2048, 1 << 20));

                let status = hooks.handshake(&mut staging, &mut conn.send);

                conn.tls_hooks = Some(hooks);
                conn.tls_in = Some(staging);
                status
            }
            None => return,
        };

        match status {
            HsStatus::NeedsMore => (),
            HsStatus::Done => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.tls_hs = false;
                }
                self.dispatch_to(id, Event::TlsHs);
                self.transport_ready(id);

                // Ciphertext that arrived together with the final handshake
                // record decrypts immediately.
                let delta = match self.conns.get_mut(&id) {
                    Some(conn) => {
                        let before = conn.recv.len();
                        if let (Some(hooks), Some(staging)) =
                            (conn.tls_hooks.as_mut(), conn.tls_in.as_mut())
                        {
                            while staging.len() > 0 {
                                match hooks.read(staging) {
                                    Ok(plain) if plain.is_empty() => break,
                                    Ok(plain) => {
                                        if !conn.recv.append(&plain) {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                        }
                        conn.recv.len() - before
                    }
                    None => 0,
                };

                if delta > 0 {
                    self.dispatch_to(id, Event::Read(delta));
                    self.drive_protocol(id);
                }
            }
            HsStatus::Failed => {
                self.conn_fail(id, ErrorKind::Tls("handshake failed"));
            }
        }

        if let Some(conn) = self.conns.get_mut(&id) {
            if conn.eof {
                conn.closing = true;
            }
        }
    }

    fn read_phase(&mut self, id: u64) {
        let skip = match self.conns.get(&id) {
            Some(conn) => {
                !conn.readable
                    || conn.full
                    || conn.connecting
                    || conn.tls_hs
                    || conn.draining
                    || conn.closing
                    || (conn.listening && !conn.udp)
            }
            None => true,
        };

        if skip {
            return;
        }

        let mut delta = 0usize;
        let mut fail: Option<ErrorKind> = None;

        if let Some(conn) = self.conns.get_mut(&id) {
            let before = conn.recv.len();

            let result = if conn.udp {
                Self::udp_ingress(conn)
            } else if conn.tls {
                Self::tls_ingress(conn)
            } else {
                let recv = &mut conn.recv;
                match &mut conn.sock {
                    Sock::Tcp(stream) => recv.ingress(&mut *stream),
                    Sock::Pipe(stream) => recv.ingress(&mut *stream),
                    _ => Ok(0),
                }
            };

            match result {
                Ok(_) => (),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => conn.readable = false,
                Err(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => conn.eof = true,
                Err(ref err) if err.kind() == io::ErrorKind::ConnectionReset => conn.eof = true,
                Err(err) => fail = Some(ErrorKind::Socket(err.kind())),
            }

            if fail.is_none() {
                delta = conn.recv.len() - before;
                conn.update_watermark(self.opts.recv_high_water);
            }
        }

        if let Some(kind) = fail {
            self.conn_fail(id, kind);
            return;
        }

        let proto = match self.conns.get(&id) {
            Some(conn) => conn.proto,
            None => return,
        };

        if delta > 0 && proto != Proto::Wakeup {
            self.dispatch_to(id, Event::Read(delta));
        }

        if delta > 0 || self.conns.get(&id).map(|c| c.eof).unwrap_or(false) {
            self.drive_protocol(id);
        }

        // End-of-stream: flush whatever the parser could not finish, then
        // close.
        let eof_pending = self
            .conns
            .get(&id)
            .map(|conn| conn.eof && !conn.closing)
            .unwrap_or(false);

        if eof_pending {
            self.eof_flush(id);
            if let Some(conn) = self.conns.get_mut(&id) {
                conn.closing = true;
            }
        }
    }

    fn udp_ingress(conn: &mut Connection) -> io::Result<usize> {
        let mut total = 0;

        loop {
            if conn.recv.free_capacity() < 2048 && !conn.recv.grow_to(conn.recv.len() + 2048) {
                return Ok(total);
            }

            let socket = match &mut conn.sock {
                Sock::Udp(socket) => socket,
                _ => return Ok(total),
            };

            if conn.listening {
                match socket.recv_from(conn.recv.write_slice()) {
                    Ok((count, peer)) => {
                        conn.remote = Some(peer);
                        conn.recv.move_tail(count);
                        total += count;
                    }
                    Err(err) => return if total > 0 { Ok(total) } else { Err(err) },
                }
            } else {
                match socket.recv(conn.recv.write_slice()) {
                    Ok(count) => {
                        conn.recv.move_tail(count);
                        total += count;
                    }
                    Err(err) => return if total > 0 { Ok(total) } else { Err(err) },
                }
            }
        }
    }

    fn tls_ingress(conn: &mut Connection) -> io::Result<usize> {
        let mut staging = match conn.tls_in.take() {
            Some(staging) => staging,
            None => return Ok(0),
        };

        let result = match &mut conn.sock {
            Sock::Tcp(stream) => staging.ingress(&mut *stream),
            _ => Ok(0),
        };

        let mut failed: Option<io::ErrorKind> = None;

        if let Some(hooks) = conn.tls_hooks.as_mut() {
            while staging.len() > 0 {
                match hooks.read(&mut staging) {
                    Ok(plain) if plain.is_empty() => break,
                    Ok(plain) => {
                        if !conn.recv.append(&plain) {
                            failed = Some(io::ErrorKind::OutOfMemory);
                            break;
                        }
                    }
                    Err(_) => {
                        failed = Some(io::ErrorKind::InvalidData);
                        break;
                    }
                }
            }
        }

        conn.tls_in = Some(staging);

        if let Some(kind) = failed {
            return Err(kind.into());
        }
        result
    }

    fn write_phase(&mut self, id: u64) {
        let mut flushed = 0usize;
        let mut fail: Option<ErrorKind> = None;

        if let Some(conn) = self.conns.get_mut(&id) {
            if conn.connecting || conn.send.is_empty() || !conn.writable {
                // Nothing to flush; a draining connection with an empty
                // send buffer is done.
                if conn.draining && conn.send.is_empty() && !conn.connecting {
                    conn.closing = true;
                }
                return;
            }

            let before = conn.send.len();
            let send = &mut conn.send;
            let result = match &mut conn.sock {
                Sock::Tcp(stream) => send.egress(&mut *stream),
                Sock::Pipe(stream) => send.egress(&mut *stream),
                Sock::Udp(socket) => {
                    // One datagram per flush.
                    let out = send.read_slice().to_vec();
                    match socket.send(&out) {
                        Ok(count) => {
                            send.consume(count);
                            Ok(count)
                        }
                        Err(err) => Err(err),
                    }
                }
                _ => Ok(0),
            };

            match result {
                Ok(_) => (),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => conn.writable = false,
                Err(err) => fail = Some(ErrorKind::Socket(err.kind())),
            }

            if fail.is_none() {
                flushed = before - conn.send.len();

                if conn.draining && conn.send.is_empty() {
                    conn.closing = true;
                }
            }
        }

        if let Some(kind) = fail {
            self.conn_fail(id, kind);
            return;
        }

        if flushed > 0 {
            let skip = self
                .conns
                .get(&id)
                .map(|conn| conn.proto == Proto::Wakeup)
                .unwrap_or(true);
            if !skip {
                self.dispatch_to(id, Event::Write(flushed));
            }
        }
    }

    /// Protocol parser pump: consumes as many complete messages as the
    /// recv buffer holds and dispatches the derived events.
    fn drive_protocol(&mut self, id: u64) {
        loop {
            let proto = match self.conns.get(&id) {
                Some(conn) if !conn.closing && !conn.draining => conn.proto,
                _ => return,
            };

            let advanced = match proto {
                Proto::Raw | Proto::Wakeup => false,
                Proto::Http => self.drive_http(id),
                Proto::Ws => self.drive_ws(id),
                Proto::Mqtt => self.drive_mqtt(id),
                Proto::Sntp => self.drive_sntp(id),
            };

            if !advanced {
                return;
            }
        }
    }

    fn drive_http(&mut self, id: u64) -> bool {
        // Emit HTTP_HDRS as soon as the header block completes, once per
        // message.
        let hdrs_pending = match self.conns.get(&id) {
            Some(conn) => !conn.hdrs_emitted,
            None => return false,
        };

        if hdrs_pending {
            let head_bytes = match self.conns.get_mut(&id) {
                Some(conn) => match http_parse::parse_head(conn.recv.read_slice()) {
                    Ok(head) => {
                        let bytes = head.head().to_vec();
                        conn.hdrs_emitted = true;
                        Some(bytes)
                    }
                    Err(NetError::Wait) => None,
                    Err(NetError::Fatal(kind)) => {
                        self.conn_fail(id, kind);
                        return false;
                    }
                },
                None => return false,
            };

            if let Some(bytes) = head_bytes {
                let view = http_parse::view(&bytes, 0);
                self.dispatch_to(id, Event::HttpHdrs(&view));
            }
        }

        let progress = match self.conns.get(&id) {
            Some(conn) => http_parse::next_message(conn.recv.read_slice(), conn.resp || conn.client),
            None => return false,
        };

        let (raw_len, scratch, body_len) = match progress {
            Ok(HttpProgress::Message {
                raw_len,
                scratch,
                body_len,
            }) => (raw_len, scratch, body_len),
            Ok(HttpProgress::NeedMore) => return false,
            Err(NetError::Wait) => return false,
            Err(NetError::Fatal(kind)) => {
                self.conn_fail(id, kind);
                return false;
            }
        };

        if let Some(conn) = self.conns.get_mut(&id) {
            conn.recv.consume(raw_len);
            conn.hdrs_emitted = false;
            conn.resp = false;
        }

        let view = http_parse::view(&scratch, body_len);

        // A client-side WebSocket handshake intercepts the response.
        let ws_handshake = self
            .conns
            .get_mut(&id)
            .and_then(|conn| conn.ws_client_hs.take());

        if let Some(hs) = ws_handshake {
            let expected = ws::accept_key(&hs.key);
            let ok = view.status() == 101
                && view
                    .header("Sec-WebSocket-Accept")
                    .map(|accept| accept.trim() == expected)
                    .unwrap_or(false);

            if !ok {
                self.conn_fail(id, ErrorKind::Parse("websocket handshake rejected"));
                return false;
            }

            if let Some(conn) = self.conns.get_mut(&id) {
                conn.proto = Proto::Ws;
                conn.websocket = true;
            }
            self.dispatch_to(id, Event::WsOpen(&view));
            return true;
        }

        self.dispatch_to(id, Event::HttpMsg(&view));

        // ws_upgrade() during the dispatch schedules WS_OPEN with the same
        // request view.
        let ws_open = self
            .conns
            .get_mut(&id)
            .map(|conn| {
                let pending = conn.ws_open_pending;
                conn.ws_open_pending = false;
                pending
            })
            .unwrap_or(false);

        if ws_open {
            self.dispatch_to(id, Event::WsOpen(&view));
        }

        true
    }

    fn drive_ws(&mut self, id: u64) -> bool {
        let progress = match self.conns.get(&id) {
            Some(conn) => ws::next_frame(conn.recv.read_slice(), self.opts.max_ws_frame),
            None => return false,
        };

        let (raw_len, flags, payload) = match progress {
            Ok(WsProgress::Frame {
                raw_len,
                flags,
                payload,
            }) => (raw_len, flags, payload),
            Ok(WsProgress::NeedMore) => return false,
            Err(NetError::Wait) => return false,
            Err(NetError::Fatal(kind)) => {
                self.conn_fail(id, kind);
                return false;
            }
        };

        let delivery = match self.conns.get_mut(&id) {
            Some(conn) => {
                conn.recv.consume(raw_len);
                match ws::assemble(conn, flags, payload) {
                    Ok(delivery) => delivery,
                    Err(NetError::Fatal(kind)) => {
                        self.conn_fail(id, kind);
                        return false;
                    }
                    Err(NetError::Wait) => return false,
                }
            }
            None => return false,
        };

        match delivery {
            WsDeliver::Pending => true,
            WsDeliver::Data { flags, payload } => {
                let frame = ws::WsFrame::new(flags, &payload);
                self.dispatch_to(id, Event::WsMsg(&frame));
                true
            }
            WsDeliver::Ctl { flags, payload } => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.ws_ctl_consumed = false;
                }

                let frame = ws::WsFrame::new(flags, &payload);
                self.dispatch_to(id, Event::WsCtl(&frame));

                let consumed = self
                    .conns
                    .get(&id)
                    .map(|conn| conn.ws_ctl_consumed)
                    .unwrap_or(true);

                if !consumed {
                    if let Some(conn) = self.conns.get_mut(&id) {
                        match flags & 0x0f {
                            ws::WS_OP_PING => {
                                let _ = conn.ws_send(&payload, ws::WS_OP_PONG);
                            }
                            ws::WS_OP_CLOSE => {
                                let _ = conn.ws_send(&payload, ws::WS_OP_CLOSE);
                                conn.drain();
                            }
                            _ => (),
                        }
                    }
                }

                true
            }
        }
    }

    fn drive_mqtt(&mut self, id: u64) -> bool {
        let progress = match self.conns.get(&id) {
            Some(conn) => mqtt::next_packet(conn.recv.read_slice(), self.opts.max_mqtt_len),
            None => return false,
        };

        let raw_len = match progress {
            Ok(mqtt::MqttProgress::Packet { raw_len }) => raw_len,
            Ok(mqtt::MqttProgress::NeedMore) => return false,
            Err(NetError::Wait) => return false,
            Err(NetError::Fatal(kind)) => {
                self.conn_fail(id, kind);
                return false;
            }
        };

        let scratch = match self.conns.get_mut(&id) {
            Some(conn) => {
                let bytes = conn.recv.read_slice()[..raw_len].to_vec();
                conn.recv.consume(raw_len);
                bytes
            }
            None => return false,
        };

        let msg = match mqtt::parse(&scratch) {
            Ok(msg) => msg,
            Err(NetError::Fatal(kind)) => {
                self.conn_fail(id, kind);
                return false;
            }
            Err(NetError::Wait) => return false,
        };

        let is_client = self
            .conns
            .get(&id)
            .map(|conn| conn.client)
            .unwrap_or(false);

        self.dispatch_to(id, Event::MqttCmd(&msg));

        match msg.cmd {
            mqtt::MQTT_CMD_CONNACK if is_client => {
                self.dispatch_to(id, Event::MqttOpen(msg.ack));
            }
            mqtt::MQTT_CMD_PUBLISH => {
                self.dispatch_to(id, Event::MqttMsg(&msg));

                if msg.qos == 1 {
                    if let Some(conn) = self.conns.get_mut(&id) {
                        let _ = conn.mqtt_puback(msg.id);
                    }
                }
            }
            mqtt::MQTT_CMD_PINGREQ => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    let _ = conn.send_bytes(&mqtt::pack_simple(mqtt::MQTT_CMD_PINGRESP));
                }
            }
            mqtt::MQTT_CMD_DISCONNECT => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.drain();
                }
            }
            _ => (),
        }

        true
    }

    fn drive_sntp(&mut self, id: u64) -> bool {
        let parsed = match self.conns.get_mut(&id) {
            Some(conn) => {
                if conn.recv.is_empty() {
                    return false;
                }

                let result = sntp::parse_reply(conn.recv.read_slice());
                match result {
                    Err(NetError::Wait) => return false,
                    other => {
                        conn.recv.clear();
                        other
                    }
                }
            }
            None => return false,
        };

        match parsed {
            Ok(epoch_ms) => {
                self.dispatch_to(id, Event::SntpTime(epoch_ms));
                // One exchange per request; the application decides when
                // to resynchronize.
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.drain();
                }
                false
            }
            Err(NetError::Fatal(kind)) => {
                self.conn_fail(id, kind);
                false
            }
            Err(NetError::Wait) => false,
        }
    }

    /// Delivers the body of a close-delimited HTTP response when the peer
    /// ends the stream.
    fn eof_flush(&mut self, id: u64) {
        let scratch = match self.conns.get_mut(&id) {
            Some(conn) if conn.proto == Proto::Http && conn.client && !conn.recv.is_empty() => {
                match http_parse::parse_head(conn.recv.read_slice()) {
                    Ok(_) => {
                        let bytes = conn.recv.read_slice().to_vec();
                        conn.recv.clear();
                        Some(bytes)
                    }
                    Err(_) => None,
                }
            }
            _ => None,
        };

        if let Some(bytes) = scratch {
            if let Ok(head) = http_parse::parse_head(&bytes) {
                let body_len = bytes.len() - head.head().len();
                drop(head);
                let view = http_parse::view(&bytes, body_len);
                self.dispatch_to(id, Event::HttpMsg(&view));
            }
        }
    }

    fn drain_wakeup(&mut self) {
        let wakeup_id = match self.wakeup_id {
            Some(id) => id,
            None => return,
        };

        let records = match self.conns.get_mut(&wakeup_id) {
            Some(conn) => wake::parse_records(&mut conn.recv),
            None => return,
        };

        for (target, payload) in records {
            if self.conns.contains_key(&target) {
                self.dispatch_to(target, Event::Wakeup(&payload));
            } else {
                logging::trace!(self.log, "wakeup for dead connection dropped"; "target" => target);
            }
        }
    }

    /// Drops connections flagged for closure: CLOSE is the last event each
    /// receives, exactly once.
    fn sweep(&mut self) {
        let doomed: Vec<u64> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.closing || (conn.draining && conn.send.is_empty() && !conn.connecting))
            .map(|(id, _)| *id)
            .collect();

        for id in doomed {
            self.flush_error(id);
            self.dispatch_to(id, Event::Close);

            if let Some(mut conn) = self.conns.shift_remove(&id) {
                conn.sock.deregister(self.poll.registry());
                conn.destroy();
            }

            if self.wakeup_id == Some(id) {
                self.wakeup_id = None;
                self.wakeup_tx = None;
            }
        }
    }
}

impl Drop for Manager {
    /// Every owned connection observes CLOSE before the manager goes
    /// away.
    fn drop(&mut self) {
        let ids: Vec<u64> = self.conns.keys().copied().collect();

        for id in ids {
            self.dispatch_to(id, Event::Close);
            if let Some(mut conn) = self.conns.shift_remove(&id) {
                conn.sock.deregister(self.poll.registry());
                conn.destroy();
            }
        }
    }
}

fn proto_for(scheme: Scheme) -> Proto {
    match scheme {
        Scheme::Http | Scheme::Https | Scheme::Ws | Scheme::Wss => Proto::Http,
        Scheme::Mqtt | Scheme::Mqtts => Proto::Mqtt,
        Scheme::Tcp | Scheme::Udp => Proto::Raw,
    }
}
