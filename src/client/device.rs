//! The connection engine: a single long-lived TCP connection with an I/O
//! thread that frames, parses and dispatches inbound messages and reconnects
//! when the link drops

use std::{
    any::Any,
    io::{ErrorKind, Read, Write},
    net::{Shutdown, TcpStream},
    panic::{catch_unwind, AssertUnwindSafe},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, warn};

use crate::{
    client::{ClientConfig, ClientError, ClientHandler, Latch},
    protocol::{KatcpError, Message, MessageKind},
    version::{ProtocolFlag, ProtocolInfo},
};

/// Wait applied to each read poll, and the delay between reconnect attempts.
/// Bounds how long `stop` takes to be observed by the I/O thread.
const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Bytes read from the socket per poll
const READ_CHUNK: usize = 4096;
/// Consecutive connect failures between warn-level log entries
const WARN_EVERY_FAILURES: u32 = 5;

/// A katcp device client.
///
/// `start` spawns the I/O thread, which connects to the device, reads and
/// parses messages and hands them to the [`ClientHandler`] supplied at
/// construction. With auto-reconnect enabled (the default) a dead connection
/// is retried every 500 ms until `stop` is called.
///
/// Messages can be sent from any thread; writes take an exclusive lock so
/// each message reaches the socket whole and in submission order.
pub struct DeviceClient {
    pub(crate) inner: Arc<Inner>,
    handler: Arc<dyn ClientHandler>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct Inner {
    host: String,
    port: u16,
    config: ClientConfig,
    /// The live socket. The I/O thread reads from a clone of it, writers
    /// clone it under `send_lock`.
    sock: Mutex<Option<TcpStream>>,
    /// Bumped on every connect and disconnect. Send retries and the framer
    /// use it to notice the socket changed underneath them.
    generation: AtomicU64,
    running: Latch,
    connected: Latch,
    protocol_received: Latch,
    protocol: Mutex<Option<ProtocolInfo>>,
    server_supports_ids: AtomicBool,
    send_lock: Mutex<()>,
    last_msg_id: AtomicU32,
}

impl DeviceClient {
    /// Creates a client for the device at `host:port`. Nothing happens until
    /// [`DeviceClient::start`] is called.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        config: ClientConfig,
        handler: impl ClientHandler + 'static,
    ) -> Self {
        Self::with_shared_handler(host, port, config, Arc::new(handler))
    }

    pub(crate) fn with_shared_handler(
        host: impl Into<String>,
        port: u16,
        config: ClientConfig,
        handler: Arc<dyn ClientHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                host: host.into(),
                port,
                config,
                sock: Mutex::new(None),
                generation: AtomicU64::new(0),
                running: Latch::new(),
                connected: Latch::new(),
                protocol_received: Latch::new(),
                protocol: Mutex::new(None),
                server_supports_ids: AtomicBool::new(false),
                send_lock: Mutex::new(()),
                last_msg_id: AtomicU32::new(0),
            }),
            handler,
            thread: Mutex::new(None),
        }
    }

    /// Starts the I/O thread. When `timeout` is given, additionally waits
    /// that long for the connection to come up and fails with
    /// [`ClientError::StartTimedOut`] when it does not.
    pub fn start(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        {
            let mut thread = self.thread.lock().unwrap();
            if thread.is_some() {
                return Err(ClientError::AlreadyRunning);
            }
            let inner = Arc::clone(&self.inner);
            let handler = Arc::clone(&self.handler);
            *thread = Some(thread::spawn(move || run(&inner, &*handler)));
        }
        if timeout.is_some() && !self.inner.connected.wait(timeout) {
            return Err(ClientError::StartTimedOut);
        }
        Ok(())
    }

    /// Signals the I/O thread to exit. `timeout` bounds the wait for a
    /// client that has been started but is not yet running.
    pub fn stop(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        if !self.inner.running.wait(timeout) {
            return Err(ClientError::NotRunning);
        }
        self.inner.running.clear();
        Ok(())
    }

    /// Joins the I/O thread. Returns whether the thread finished within the
    /// timeout (`None` waits indefinitely).
    pub fn join(&self, timeout: Option<Duration>) -> Result<bool, ClientError> {
        let mut slot = self.thread.lock().unwrap();
        let handle = slot.take().ok_or(ClientError::NotRunning)?;
        match timeout {
            None => {
                let _ = handle.join();
                Ok(true)
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !handle.is_finished() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(10));
                }
                if handle.is_finished() {
                    let _ = handle.join();
                    Ok(true)
                } else {
                    *slot = Some(handle);
                    Ok(false)
                }
            }
        }
    }

    /// Whether the I/O loop is running
    pub fn running(&self) -> bool {
        self.inner.running.is_set()
    }

    /// Whether the socket is currently connected
    pub fn is_connected(&self) -> bool {
        self.inner.sock.lock().unwrap().is_some()
    }

    /// Waits until the client is connected, returning whether it is
    pub fn wait_connected(&self, timeout: Option<Duration>) -> bool {
        self.inner.connected.wait(timeout)
    }

    /// Waits until the `katcp-protocol` handshake has been received,
    /// returning whether it has
    pub fn wait_protocol(&self, timeout: Option<Duration>) -> bool {
        self.inner.protocol_received.wait(timeout)
    }

    /// The protocol version the server advertised on this connection, if the
    /// handshake has arrived
    pub fn protocol_info(&self) -> Option<ProtocolInfo> {
        self.inner.protocol.lock().unwrap().clone()
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Sends a request message.
    ///
    /// `use_mid: None` attaches a message id exactly when the server
    /// advertised support for them (never before the handshake). Passing a
    /// message or `use_mid: Some(true)` with an explicit id to a server
    /// without support fails with [`ClientError::Version`].
    ///
    /// Returns the message as sent, so the caller learns the assigned id.
    pub fn request(&self, msg: Message, use_mid: Option<bool>) -> Result<Message, ClientError> {
        let msg = self.prepare_request(msg, use_mid)?;
        self.send(&msg)?;
        Ok(msg)
    }

    /// Resolves `use_mid` and assigns the next message id without sending
    pub(crate) fn prepare_request(
        &self,
        mut msg: Message,
        use_mid: Option<bool>,
    ) -> Result<Message, ClientError> {
        if msg.kind != MessageKind::Request {
            return Err(ClientError::Protocol(KatcpError::IncorrectType));
        }
        let supported = self.inner.server_supports_ids.load(Ordering::Acquire);
        if use_mid.unwrap_or(supported) && msg.id.is_none() {
            msg.id = Some(self.inner.next_id());
        }
        if msg.id.is_some() && !supported {
            return Err(ClientError::Version);
        }
        Ok(msg)
    }

    /// Serializes and writes a message to the device.
    ///
    /// Writes hold an exclusive lock, so concurrent senders are totally
    /// ordered and never interleave within a line. A write failure tears the
    /// connection down.
    pub fn send(&self, msg: &Message) -> Result<(), ClientError> {
        self.inner.send(&*self.handler, msg)
    }
}

impl Inner {
    fn next_id(&self) -> u32 {
        self.last_msg_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn send(&self, handler: &dyn ClientHandler, msg: &Message) -> Result<(), ClientError> {
        let data = msg.to_string();
        // Log all sent messages here so no one else has to
        debug!("sending: {}", data.trim_end());

        let result = self.write_locked(data.as_bytes());
        if let Err(ClientError::SendFailed(reason)) = &result {
            error!(
                "failed to send message to {}:{}: {}",
                self.host, self.port, reason
            );
            // The send lock is released here, the disconnect upcall may send
            self.disconnect(handler);
        }
        result
    }

    fn write_locked(&self, data: &[u8]) -> Result<(), ClientError> {
        let _guard = self.send_lock.lock().unwrap();
        let generation = self.generation.load(Ordering::Acquire);
        let mut stream = {
            let sock = self.sock.lock().unwrap();
            match sock.as_ref() {
                Some(stream) => stream
                    .try_clone()
                    .map_err(|e| ClientError::SendFailed(e.to_string()))?,
                None => return Err(ClientError::NotConnected),
            }
        };
        let mut sent = 0;
        while sent < data.len() {
            match stream.write(&data[sent..]) {
                Ok(0) => return Err(ClientError::SendFailed("connection closed".to_owned())),
                Ok(n) => sent += n,
                Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) => {
                    // Transient, retry unless the socket was swapped out
                    // underneath us
                    if self.generation.load(Ordering::Acquire) != generation {
                        return Err(ClientError::SendFailed(
                            "connection changed during send".to_owned(),
                        ));
                    }
                }
                Err(e) => return Err(ClientError::SendFailed(e.to_string())),
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.sock.lock().unwrap().is_some()
    }

    fn connect(&self, handler: &dyn ClientHandler, failures: &mut u32) {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).and_then(|stream| {
            // Our message packets are small, don't delay sending them
            stream.set_nodelay(true)?;
            stream.set_read_timeout(Some(POLL_INTERVAL))?;
            Ok(stream)
        });
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                *failures += 1;
                if *failures % WARN_EVERY_FAILURES == 0 {
                    warn!("failed to connect to {}:{}: {}", self.host, self.port, e);
                } else {
                    debug!("failed to connect to {}:{}: {}", self.host, self.port, e);
                }
                return;
            }
        };
        if *failures >= WARN_EVERY_FAILURES {
            warn!("reconnected to {}:{}", self.host, self.port);
        }
        *failures = 0;
        *self.sock.lock().unwrap() = Some(stream);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.connected.set();
        if !upcall_connected(handler, true) {
            self.disconnect(handler);
        }
    }

    /// Tears down the current connection, at most once per connection no
    /// matter how many threads race here
    fn disconnect(&self, handler: &dyn ClientHandler) {
        let sock = self.sock.lock().unwrap().take();
        if let Some(sock) = sock {
            self.generation.fetch_add(1, Ordering::AcqRel);
            let _ = sock.shutdown(Shutdown::Both);
            self.connected.clear();
            self.protocol_received.clear();
            *self.protocol.lock().unwrap() = None;
            self.server_supports_ids.store(false, Ordering::Release);
            upcall_connected(handler, false);
        }
    }

    pub(crate) fn latch_protocol(&self, msg: &Message) {
        if msg.arguments.len() < 2 || msg.arguments[0] != "katcp-protocol" {
            return;
        }
        match ProtocolInfo::from_str(&msg.arguments[1]) {
            Ok(info) => {
                self.server_supports_ids
                    .store(info.supports(ProtocolFlag::MessageIds), Ordering::Release);
                *self.protocol.lock().unwrap() = Some(info);
                self.protocol_received.set();
            }
            Err(e) => warn!(
                "could not parse katcp-protocol version {:?}: {}",
                msg.arguments[1], e
            ),
        }
    }
}

/// Invokes the connection upcall, containing panics. Returns whether the
/// upcall completed normally.
fn upcall_connected(handler: &dyn ClientHandler, up: bool) -> bool {
    match catch_unwind(AssertUnwindSafe(|| handler.notify_connected(up))) {
        Ok(()) => true,
        Err(payload) => {
            error!(
                "connection notification handler panicked: {}",
                panic_message(&payload)
            );
            false
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("opaque panic payload")
}

/// The I/O loop: read and dispatch while connected, reconnect while not
fn run(inner: &Arc<Inner>, handler: &dyn ClientHandler) {
    debug!("starting katcp client io thread");
    let mut failures = 0u32;
    let mut carry: Vec<u8> = Vec::new();
    let mut seen_generation = inner.generation.load(Ordering::Acquire);
    let mut buf = [0u8; READ_CHUNK];

    if !inner.config.auto_reconnect {
        inner.connect(handler, &mut failures);
        if !inner.is_connected() {
            error!("failed to connect to {}:{}", inner.host, inner.port);
            return;
        }
    }

    inner.running.set();
    while inner.running.is_set() {
        // A fresh handle each iteration so a reconnect is picked up
        let reader = {
            inner
                .sock
                .lock()
                .unwrap()
                .as_ref()
                .and_then(|s| s.try_clone().ok())
        };
        match reader {
            Some(mut sock) => {
                let generation = inner.generation.load(Ordering::Acquire);
                if generation != seen_generation {
                    // New connection, drop any partial line from the old one
                    carry.clear();
                    seen_generation = generation;
                }
                match sock.read(&mut buf) {
                    Ok(0) => {
                        // EOF from server
                        debug!("server {}:{} closed the connection", inner.host, inner.port);
                        inner.disconnect(handler);
                    }
                    Ok(n) => handle_chunk(inner, handler, &mut carry, &buf[..n]),
                    Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                    Err(e) => {
                        debug!("socket error: {}", e);
                        inner.disconnect(handler);
                    }
                }
            }
            None => {
                if !inner.config.auto_reconnect {
                    inner.running.clear();
                    break;
                }
                inner.connect(handler, &mut failures);
                if !inner.is_connected() {
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }
    inner.disconnect(handler);
    debug!("stopping katcp client io thread");
}

/// Appends a chunk to the carry-over buffer and dispatches every complete
/// line in it. Lines end at a linefeed or a carriage return, the trailing
/// partial line is retained for the next chunk.
fn handle_chunk(inner: &Inner, handler: &dyn ClientHandler, carry: &mut Vec<u8>, chunk: &[u8]) {
    carry.extend_from_slice(chunk);
    while let Some(pos) = carry.iter().position(|&b| b == b'\n' || b == b'\r') {
        let rest = carry.split_off(pos + 1);
        let mut line = std::mem::replace(carry, rest);
        line.pop();
        if line.is_empty() {
            continue;
        }
        match std::str::from_utf8(&line) {
            Ok(text) => match Message::from_str(text) {
                Ok(msg) => handle_message(inner, handler, msg),
                // A bad line is logged and dropped, the connection stays up
                Err(e) => error!("dropping malformed line {:?}: {}", text, e),
            },
            Err(e) => error!("dropping non-utf8 line: {}", e),
        }
    }
}

fn handle_message(inner: &Inner, handler: &dyn ClientHandler, msg: Message) {
    // Log all received messages here so no one else has to
    debug!("received: {}", msg.to_string().trim_end());
    match msg.kind {
        MessageKind::Inform => {
            if msg.name == "version-connect" {
                inner.latch_protocol(&msg);
            }
            let name = msg.name.clone();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler.handle_inform(msg))) {
                error!(
                    "inform {} handler panicked: {}",
                    name,
                    panic_message(&payload)
                );
            }
        }
        MessageKind::Reply => {
            let name = msg.name.clone();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler.handle_reply(msg))) {
                error!(
                    "reply {} handler panicked: {}",
                    name,
                    panic_message(&payload)
                );
            }
        }
        MessageKind::Request => {
            let reply = match catch_unwind(AssertUnwindSafe(|| handler.handle_request(&msg))) {
                Ok(reply) => reply,
                Err(payload) => {
                    error!(
                        "request {} handler panicked: {}",
                        msg.name,
                        panic_message(&payload)
                    );
                    return;
                }
            };
            match reply {
                Some(mut reply) => {
                    if reply.kind != MessageKind::Reply || reply.name != msg.name {
                        error!("request {} handler returned an invalid reply", msg.name);
                        return;
                    }
                    reply.id = msg.id;
                    if let Err(e) = inner.send(handler, &reply) {
                        error!("failed to reply to request {}: {}", msg.name, e);
                    }
                }
                None => debug!("no handler for request {}", msg.name),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> DeviceClient {
        DeviceClient::new("localhost", 7147, ClientConfig::default(), ())
    }

    #[test]
    fn request_requires_request_kind() {
        let c = client();
        let reply = Message::reply("watchdog", vec!["ok"]).unwrap();
        assert!(matches!(
            c.prepare_request(reply, None),
            Err(ClientError::Protocol(KatcpError::IncorrectType))
        ));
    }

    #[test]
    fn no_mid_before_handshake() {
        let c = client();
        let msg = Message::request("watchdog", Vec::<String>::new()).unwrap();
        // Default resolves to false until the server advertises support
        let prepared = c.prepare_request(msg, None).unwrap();
        assert_eq!(prepared.id, None);
    }

    #[test]
    fn explicit_mid_without_support_is_a_version_error() {
        let c = client();
        let msg =
            Message::new(MessageKind::Request, "watchdog", Some(3), Vec::<String>::new()).unwrap();
        assert_eq!(c.prepare_request(msg, None), Err(ClientError::Version));
    }

    #[test]
    fn mids_assigned_in_sequence_after_handshake() {
        let c = client();
        let handshake =
            Message::inform("version-connect", vec!["katcp-protocol", "5.0-M"]).unwrap();
        c.inner.latch_protocol(&handshake);
        assert!(c.inner.protocol_received.is_set());

        let msg = Message::request("watchdog", Vec::<String>::new()).unwrap();
        let first = c.prepare_request(msg.clone(), None).unwrap();
        let second = c.prepare_request(msg, None).unwrap();
        assert_eq!(first.id, Some(1));
        assert_eq!(second.id, Some(2));
    }

    #[test]
    fn legacy_server_keeps_requests_bare() {
        let c = client();
        let handshake = Message::inform("version-connect", vec!["katcp-protocol", "4.0"]).unwrap();
        c.inner.latch_protocol(&handshake);

        let msg = Message::request("watchdog", Vec::<String>::new()).unwrap();
        let prepared = c.prepare_request(msg.clone(), None).unwrap();
        assert_eq!(prepared.id, None);
        // Opting in explicitly is refused
        assert_eq!(c.prepare_request(msg, Some(true)), Err(ClientError::Version));
    }

    #[test]
    fn send_without_connection_fails() {
        let c = client();
        let msg = Message::request("watchdog", Vec::<String>::new()).unwrap();
        assert_eq!(c.send(&msg), Err(ClientError::NotConnected));
    }

    #[test]
    fn framer_splits_on_both_terminators() {
        let inner = client().inner;
        let mut carry = Vec::new();
        // Handlers drop everything, this only exercises the framer paths
        handle_chunk(&inner, &(), &mut carry, b"!foo ok\r!bar");
        assert_eq!(carry, b"!bar");
        handle_chunk(&inner, &(), &mut carry, b" ok\n\n#baz");
        assert_eq!(carry, b"#baz");
    }
}
