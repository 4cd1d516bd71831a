//! The link proper: one I/O thread, a command channel, and a mio poll loop
//! that owns the socket, the framed read state machine, the FIFO send queue
//! and both timers (keep-alive, reconnect).

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::ToSocketAddrs,
    sync::{
        Arc, Mutex,
        mpsc::{self, Receiver, Sender},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use mio::{Events, Interest, Poll, Token, Waker, net::TcpStream};
use rand::{SeedableRng, rngs::SmallRng};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::{
    frame::{FrameKind, HEADER_LEN, MAX_PAYLOAD, encode_frame, parse_header},
    reconnect::{PortRing, ReconnectPolicy, ReconnectState},
};

const STREAM: Token = Token(0);
const WAKER: Token = Token(1);

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Inbound frame callback: raw kind byte plus payload. Runs on the link's
/// I/O thread.
pub type FrameHandler = Box<dyn FnMut(u8, &[u8]) + Send>;

#[derive(Clone, Debug)]
pub struct LinkConfig {
    pub host: String,
    pub ports: Vec<u16>,
    pub reconnect: ReconnectPolicy,
    /// Optional SO_SNDBUF/SO_RCVBUF hint.
    pub socket_buf: Option<usize>,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            ports: vec![5293, 5294, 5295],
            reconnect: ReconnectPolicy::default(),
            socket_buf: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum LinkError {
    #[error("payload length {len} exceeds the {MAX_PAYLOAD}-byte frame limit")]
    Oversize { len: usize },
    #[error("link is not running")]
    Closed,
}

enum Command {
    Connect { host: String, first_port: u16 },
    Send(Vec<u8>),
    Close,
}

struct IoHandle {
    tx: Sender<Command>,
    waker: Arc<Waker>,
    thread: JoinHandle<()>,
}

/// Persistent framed TCP client for the Kore controller.
///
/// `close` then `connect` is permitted and restarts the state machine
/// cleanly on a fresh I/O thread.
pub struct KoreLink {
    config: LinkConfig,
    handler: Arc<Mutex<FrameHandler>>,
    io: Option<IoHandle>,
}

impl KoreLink {
    pub fn new(config: LinkConfig, handler: impl FnMut(u8, &[u8]) + Send + 'static) -> Self {
        Self { config, handler: Arc::new(Mutex::new(Box::new(handler))), io: None }
    }

    /// Kick off the connect state machine toward `host:first_port`,
    /// spawning the I/O thread if it is not running.
    pub fn connect(&mut self, host: &str, first_port: u16) -> io::Result<()> {
        if self.io.is_none() {
            self.spawn_io()?;
        }
        if let Some(io) = &self.io {
            let _ = io.tx.send(Command::Connect { host: host.to_string(), first_port });
            let _ = io.waker.wake();
        }
        Ok(())
    }

    /// Queue a frame for sending. Accepted frames go out strictly FIFO; a
    /// later write failure discards them without replay.
    pub fn send_frame(&self, kind: FrameKind, payload: &[u8]) -> Result<(), LinkError> {
        if payload.len() > MAX_PAYLOAD {
            warn!(len = payload.len(), "link: oversize frame rejected");
            return Err(LinkError::Oversize { len: payload.len() });
        }
        let Some(io) = &self.io else { return Err(LinkError::Closed) };
        io.tx.send(Command::Send(encode_frame(kind, payload))).map_err(|_| LinkError::Closed)?;
        let _ = io.waker.wake();
        Ok(())
    }

    /// Cancel timers, close the socket, stop the I/O thread. Idempotent.
    pub fn close(&mut self) {
        if let Some(io) = self.io.take() {
            let _ = io.tx.send(Command::Close);
            let _ = io.waker.wake();
            let _ = io.thread.join();
            info!("link: closed");
        }
    }

    fn spawn_io(&mut self) -> io::Result<()> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        let (tx, rx) = mpsc::channel();
        let handler = Arc::clone(&self.handler);
        let config = self.config.clone();

        let thread = thread::Builder::new()
            .name("kore-link-io".to_string())
            .spawn(move || IoLoop::new(poll, rx, handler, config).run())?;

        self.io = Some(IoHandle { tx, waker, thread });
        Ok(())
    }
}

impl Drop for KoreLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ConnState {
    Alive,
    Disconnected,
}

enum ReadOutcome {
    Frame { kind: u8, len: usize },
    WouldBlock,
    Disconnected,
}

#[derive(Clone, Copy)]
enum RxState {
    /// Waiting for the 3-byte frame header.
    Header { buf: [u8; HEADER_LEN], have: usize },
    /// Reading `len` payload bytes.
    Payload { kind: u8, len: usize, offset: usize },
}

struct Conn {
    stream: TcpStream,
    connecting: bool,
    rx_state: RxState,
    rx_buf: Vec<u8>,
}

impl Conn {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            connecting: true,
            rx_state: RxState::Header { buf: [0; HEADER_LEN], have: 0 },
            rx_buf: vec![0; 4096],
        }
    }

    /// Read a single complete frame if present; loops until one is assembled
    /// or the read would block. A zero-length frame skips the body read.
    fn read_frame(&mut self) -> ReadOutcome {
        loop {
            match self.rx_state {
                RxState::Header { mut buf, mut have } => {
                    while have < HEADER_LEN {
                        match self.stream.read(&mut buf[have..]) {
                            Ok(0) => return ReadOutcome::Disconnected,
                            Ok(n) => have += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::Header { buf, have };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(err) => {
                                debug!(?err, "link: read header");
                                return ReadOutcome::Disconnected;
                            }
                        }
                    }

                    let (kind, len) = parse_header(&buf);
                    self.rx_state = RxState::Header { buf: [0; HEADER_LEN], have: 0 };
                    if len == 0 {
                        return ReadOutcome::Frame { kind, len: 0 };
                    }
                    if len > self.rx_buf.len() {
                        self.rx_buf.resize(len, 0);
                    }
                    self.rx_state = RxState::Payload { kind, len, offset: 0 };
                }

                RxState::Payload { kind, len, mut offset } => {
                    while offset < len {
                        match self.stream.read(&mut self.rx_buf[offset..len]) {
                            Ok(0) => return ReadOutcome::Disconnected,
                            Ok(n) => offset += n,
                            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                                self.rx_state = RxState::Payload { kind, len, offset };
                                return ReadOutcome::WouldBlock;
                            }
                            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                            Err(err) => {
                                debug!(?err, "link: read payload");
                                return ReadOutcome::Disconnected;
                            }
                        }
                    }
                    self.rx_state = RxState::Header { buf: [0; HEADER_LEN], have: 0 };
                    return ReadOutcome::Frame { kind, len };
                }
            }
        }
    }
}

struct IoLoop {
    poll: Poll,
    events: Events,
    rx: Receiver<Command>,
    handler: Arc<Mutex<FrameHandler>>,
    config: LinkConfig,
    host: String,
    ports: PortRing,
    policy: ReconnectPolicy,
    backoff: ReconnectState,
    /// Jitter PRNG, seeded once per I/O thread.
    rng: SmallRng,
    conn: Option<Conn>,
    send_q: VecDeque<Vec<u8>>,
    writable_armed: bool,
    reconnect_at: Option<Instant>,
    keepalive_at: Option<Instant>,
    closing: bool,
}

impl IoLoop {
    fn new(
        poll: Poll,
        rx: Receiver<Command>,
        handler: Arc<Mutex<FrameHandler>>,
        config: LinkConfig,
    ) -> Self {
        let ports = PortRing::new(&config.ports);
        let policy = config.reconnect;
        let host = config.host.clone();
        Self {
            poll,
            events: Events::with_capacity(64),
            rx,
            handler,
            config,
            host,
            ports,
            policy,
            backoff: ReconnectState::default(),
            rng: SmallRng::from_os_rng(),
            conn: None,
            send_q: VecDeque::new(),
            writable_armed: false,
            reconnect_at: None,
            keepalive_at: None,
            closing: false,
        }
    }

    fn run(mut self) {
        debug!("link: io thread started");
        while !self.closing {
            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(?e, "link: poll failed");
                break;
            }

            let fired: Vec<(Token, bool, bool)> = self
                .events
                .iter()
                .map(|e| (e.token(), e.is_readable(), e.is_writable()))
                .collect();
            for (token, readable, writable) in fired {
                if token == STREAM {
                    self.on_stream_event(readable, writable);
                }
            }

            self.drain_commands();
            self.check_timers();
        }
        self.teardown_conn();
        debug!("link: io thread exiting");
    }

    fn next_timeout(&self) -> Option<Duration> {
        let now = Instant::now();
        [self.reconnect_at, self.keepalive_at]
            .into_iter()
            .flatten()
            .map(|t| t.saturating_duration_since(now))
            .min()
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                Command::Connect { host, first_port } => {
                    self.host = host;
                    self.ports = PortRing::new(&self.config.ports);
                    if self.ports.is_empty() {
                        self.ports = PortRing::new(&[first_port]);
                    }
                    self.ports.start_at(first_port);
                    if self.conn.is_none() {
                        self.start_connect();
                    }
                }
                Command::Send(buf) => self.enqueue(buf),
                Command::Close => self.closing = true,
            }
        }
    }

    fn check_timers(&mut self) {
        let now = Instant::now();

        if self.reconnect_at.is_some_and(|t| t <= now) {
            self.reconnect_at = None;
            if self.conn.is_none() && !self.closing {
                self.start_connect();
            }
        }

        if self.keepalive_at.is_some_and(|t| t <= now) {
            if self.conn.as_ref().is_some_and(|c| !c.connecting) {
                trace!("link: keep-alive");
                self.keepalive_at = Some(now + KEEPALIVE_INTERVAL);
                self.enqueue(encode_frame(FrameKind::KeepAlive, &[]));
            } else {
                self.keepalive_at = None;
            }
        }
    }

    fn enqueue(&mut self, buf: Vec<u8>) {
        self.send_q.push_back(buf);
        if self.conn.as_ref().is_some_and(|c| !c.connecting) &&
            self.flush_send_q() == ConnState::Disconnected
        {
            self.schedule_reconnect();
        }
    }

    fn start_connect(&mut self) {
        let Some(port) = self.ports.current() else {
            warn!("link: no candidate ports configured");
            return;
        };

        let addr = match (self.host.as_str(), port).to_socket_addrs().map(|mut it| it.next()) {
            Ok(Some(addr)) => addr,
            Ok(None) | Err(_) => {
                warn!(host = %self.host, port, "link: resolve failed");
                self.schedule_reconnect();
                return;
            }
        };

        match TcpStream::connect(addr) {
            Ok(mut stream) => {
                if let Some(size) = self.config.socket_buf {
                    set_socket_buf_size(&stream, size);
                }
                // WRITABLE doubles as the connect-completion signal.
                if let Err(e) = self.poll.registry().register(
                    &mut stream,
                    STREAM,
                    Interest::READABLE | Interest::WRITABLE,
                ) {
                    warn!(?e, "link: register failed");
                    self.schedule_reconnect();
                    return;
                }
                debug!(%addr, "link: connecting");
                self.conn = Some(Conn::new(stream));
                self.writable_armed = true;
            }
            Err(e) => {
                warn!(?e, %addr, "link: connect failed");
                self.schedule_reconnect();
            }
        }
    }

    fn on_stream_event(&mut self, readable: bool, writable: bool) {
        if self.conn.is_none() {
            return;
        }

        if self.conn.as_ref().is_some_and(|c| c.connecting) && !self.finish_connect() {
            return;
        }

        if readable && self.read_frames() == ConnState::Disconnected {
            self.schedule_reconnect();
            return;
        }

        if writable && self.flush_send_q() == ConnState::Disconnected {
            self.schedule_reconnect();
        }
    }

    /// Resolve the in-flight non-blocking connect. Returns whether the
    /// connection is usable.
    fn finish_connect(&mut self) -> bool {
        let Some(conn) = self.conn.as_mut() else { return false };

        match conn.stream.take_error() {
            Ok(Some(e)) => {
                warn!(?e, "link: connect error");
                self.schedule_reconnect();
                return false;
            }
            Err(e) => {
                warn!(?e, "link: take_error failed");
                self.schedule_reconnect();
                return false;
            }
            Ok(None) => {}
        }

        match conn.stream.peer_addr() {
            Ok(addr) => {
                conn.connecting = false;
                let _ = conn.stream.set_nodelay(true);
                self.backoff.on_connected(&self.policy);
                self.reconnect_at = None;
                self.keepalive_at = Some(Instant::now() + KEEPALIVE_INTERVAL);
                info!(%addr, "link: connected");
                if self.flush_send_q() == ConnState::Disconnected {
                    self.schedule_reconnect();
                    return false;
                }
                true
            }
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => false,
            Err(e) => {
                warn!(?e, "link: connect failed");
                self.schedule_reconnect();
                false
            }
        }
    }

    fn read_frames(&mut self) -> ConnState {
        loop {
            let Some(conn) = self.conn.as_mut() else { return ConnState::Disconnected };
            match conn.read_frame() {
                ReadOutcome::Frame { kind, len } => {
                    trace!(kind, len, "link: frame in");
                    (self.handler.lock().unwrap())(kind, &conn.rx_buf[..len]);
                }
                ReadOutcome::WouldBlock => return ConnState::Alive,
                ReadOutcome::Disconnected => return ConnState::Disconnected,
            }
        }
    }

    /// Write queued frames until the kernel blocks or the queue drains; at
    /// most one partially-written buffer sits at the front.
    fn flush_send_q(&mut self) -> ConnState {
        {
            let Some(conn) = self.conn.as_mut() else { return ConnState::Alive };
            if conn.connecting {
                return ConnState::Alive;
            }

            while let Some(front) = self.send_q.front_mut() {
                match conn.stream.write(front) {
                    Ok(0) => return ConnState::Disconnected,
                    Ok(n) => {
                        if n == front.len() {
                            self.send_q.pop_front();
                        } else {
                            front.drain(..n);
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        debug!(?err, "link: write failed");
                        return ConnState::Disconnected;
                    }
                }
            }
        }

        // Hold WRITABLE interest only while there is something to flush.
        let want_writable = !self.send_q.is_empty();
        if want_writable != self.writable_armed {
            if let Some(conn) = self.conn.as_mut() {
                let interest = if want_writable {
                    Interest::READABLE | Interest::WRITABLE
                } else {
                    Interest::READABLE
                };
                if let Err(e) = self.poll.registry().reregister(&mut conn.stream, STREAM, interest)
                {
                    debug!(?e, "link: reregister failed");
                    return ConnState::Disconnected;
                }
                self.writable_armed = want_writable;
            }
        }

        ConnState::Alive
    }

    fn schedule_reconnect(&mut self) {
        self.teardown_conn();
        if self.closing {
            return;
        }
        if !self.ports.is_empty() {
            self.ports.advance();
        }
        let delay = self.backoff.next_delay(&self.policy, &mut self.rng);
        self.reconnect_at = Some(Instant::now() + delay);
        warn!(
            delay_ms = delay.as_millis() as u64,
            attempt = self.backoff.attempt,
            next_port = self.ports.current(),
            "link: scheduling reconnect"
        );
    }

    fn teardown_conn(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            if !conn.connecting {
                // In-flight and queued buffers are not replayed.
                self.send_q.clear();
            }
        }
        self.keepalive_at = None;
        self.writable_armed = false;
    }
}

/// Kernel SO_SNDBUF/SO_RCVBUF hint.
#[cfg(unix)]
fn set_socket_buf_size(stream: &TcpStream, size: usize) {
    use std::os::fd::AsRawFd;
    let fd = stream.as_raw_fd();
    let size = size as libc::c_int;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            std::ptr::addr_of!(size).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            std::ptr::addr_of!(size).cast(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}

#[cfg(not(unix))]
fn set_socket_buf_size(_stream: &TcpStream, size: usize) {
    debug!(size, "link: socket buffer hint unsupported on this platform");
}
