//! Threaded katcp device clients
//!
//! Three layers build on each other here. [`DeviceClient`] owns the TCP
//! connection and its I/O thread, frames and parses inbound lines and
//! dispatches them to a [`ClientHandler`]. [`BlockingClient`] adds a
//! one-request-at-a-time synchronous API that collects the informs belonging
//! to a request until its reply arrives. [`CallbackClient`] correlates many
//! concurrent requests by message id (or request name on pre-v5 servers) and
//! delivers replies and informs to per-request callbacks with a per-request
//! timeout.

use std::{
    collections::HashMap,
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use log::debug;
use thiserror::Error;

use crate::protocol::{KatcpError, Message};

pub mod blocking;
pub mod callback;
pub mod device;
mod timer;

pub use blocking::BlockingClient;
pub use callback::{CallbackClient, InformCallback, ReplyCallback};
pub use device::DeviceClient;

#[derive(Debug, PartialEq, Error)]
/// Errors surfaced by the client layers
pub enum ClientError {
    /// A send was attempted without a live connection
    #[error("client is not connected")]
    NotConnected,
    /// `start` was called on a client that already has an I/O thread
    #[error("device client already started")]
    AlreadyRunning,
    /// A lifecycle operation needs a running client
    #[error("device client not running")]
    NotRunning,
    /// `start` was asked to wait for the connection and the wait expired
    #[error("device client failed to start")]
    StartTimedOut,
    /// A message id was used with a server that does not support them
    #[error("message identifiers are only supported for katcp version 5 and up")]
    Version,
    /// No reply arrived within the request window
    #[error("request {name} timed out after {seconds} seconds")]
    Timeout { name: String, seconds: f64 },
    /// The socket write failed, the connection is torn down
    #[error("failed to send message: {0}")]
    SendFailed(String),
    /// The client was stopped while the request was outstanding. The text is
    /// what the synthetic failure reply carries.
    #[error("Client stopped before reply was received")]
    Stopped,
    /// The reply callback was not invoked within the timeout window plus
    /// grace period, which points at a stalled dispatcher rather than a
    /// slow server
    #[error("reply handler was not invoked within the timeout period")]
    ReplyOverdue,
    /// A codec error bubbled out of the client
    #[error(transparent)]
    Protocol(#[from] KatcpError),
}

#[derive(Debug, Clone)]
/// Connection and request defaults for a client
pub struct ClientConfig {
    /// Whether to automatically reconnect when the connection dies
    pub auto_reconnect: bool,
    /// Default window to wait for a reply. `None` waits indefinitely.
    pub request_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            request_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// The set of upcalls a [`DeviceClient`] makes from its I/O thread.
///
/// Implementations must be prepared to be called from that thread while
/// caller threads are inside the client's methods. A panicking handler is
/// caught and logged, it never tears down the I/O loop (a panicking
/// [`ClientHandler::notify_connected`] drops the connection but the loop
/// carries on).
pub trait ClientHandler: Send + Sync {
    /// An inform message arrived
    fn handle_inform(&self, msg: Message) {
        let _ = msg;
    }

    /// A reply message arrived
    fn handle_reply(&self, msg: Message) {
        let _ = msg;
    }

    /// A request message arrived (servers rarely send these). Returning a
    /// reply makes the client send it back with the request's message id
    /// attached; `None` leaves the request unanswered.
    fn handle_request(&self, msg: &Message) -> Option<Message> {
        let _ = msg;
        None
    }

    /// The connection was established (`true`) or lost (`false`).
    ///
    /// This runs on the I/O thread, blocking here stalls all message
    /// processing.
    fn notify_connected(&self, connected: bool) {
        let _ = connected;
    }
}

/// The no-op handler, useful when only the request/reply APIs are of interest
impl ClientHandler for () {}

pub type InformFn = Box<dyn Fn(Message) + Send + Sync>;
pub type ReplyFn = Box<dyn Fn(Message) + Send + Sync>;
pub type RequestFn = Box<dyn Fn(&Message) -> Message + Send + Sync>;
pub type ConnectedFn = Box<dyn Fn(bool) + Send + Sync>;

/// A [`ClientHandler`] built from explicitly registered per-name callbacks.
///
/// Handlers are looked up by message name; messages without a registered
/// handler go to the `unhandled_*` fallbacks when present and are otherwise
/// logged and dropped.
///
/// ```
/// use katcp_client::client::Handlers;
///
/// let handlers = Handlers::new()
///     .inform("sensor-status", |msg| println!("status: {}", msg))
///     .on_connected(|up| println!("connected: {}", up));
/// ```
#[derive(Default)]
pub struct Handlers {
    informs: HashMap<String, InformFn>,
    replies: HashMap<String, ReplyFn>,
    requests: HashMap<String, RequestFn>,
    fallback_inform: Option<InformFn>,
    fallback_reply: Option<ReplyFn>,
    connected: Option<ConnectedFn>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for informs named `name`
    pub fn inform(mut self, name: &str, f: impl Fn(Message) + Send + Sync + 'static) -> Self {
        self.informs.insert(name.to_owned(), Box::new(f));
        self
    }

    /// Register a handler for replies named `name`
    pub fn reply(mut self, name: &str, f: impl Fn(Message) + Send + Sync + 'static) -> Self {
        self.replies.insert(name.to_owned(), Box::new(f));
        self
    }

    /// Register a handler for requests named `name`. The handler's return
    /// value is sent back as the reply.
    pub fn request(
        mut self,
        name: &str,
        f: impl Fn(&Message) -> Message + Send + Sync + 'static,
    ) -> Self {
        self.requests.insert(name.to_owned(), Box::new(f));
        self
    }

    /// Fallback for informs without a registered handler
    pub fn unhandled_inform(mut self, f: impl Fn(Message) + Send + Sync + 'static) -> Self {
        self.fallback_inform = Some(Box::new(f));
        self
    }

    /// Fallback for replies without a registered handler
    pub fn unhandled_reply(mut self, f: impl Fn(Message) + Send + Sync + 'static) -> Self {
        self.fallback_reply = Some(Box::new(f));
        self
    }

    /// Called with `true`/`false` when the connection comes and goes
    pub fn on_connected(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.connected = Some(Box::new(f));
        self
    }
}

impl ClientHandler for Handlers {
    fn handle_inform(&self, msg: Message) {
        if let Some(f) = self.informs.get(&msg.name) {
            f(msg);
        } else if let Some(f) = &self.fallback_inform {
            f(msg);
        } else {
            debug!("unhandled inform {}", msg.name);
        }
    }

    fn handle_reply(&self, msg: Message) {
        if let Some(f) = self.replies.get(&msg.name) {
            f(msg);
        } else if let Some(f) = &self.fallback_reply {
            f(msg);
        } else {
            debug!("unhandled reply {}", msg.name);
        }
    }

    fn handle_request(&self, msg: &Message) -> Option<Message> {
        self.requests.get(&msg.name).map(|f| f(msg))
    }

    fn notify_connected(&self, connected: bool) {
        if let Some(f) = &self.connected {
            f(connected);
        }
    }
}

/// A latching boolean signal, the std rendering of a `threading.Event`
pub(crate) struct Latch {
    state: Mutex<bool>,
    cond: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        *self.state.lock().unwrap() = true;
        self.cond.notify_all();
    }

    pub(crate) fn clear(&self) {
        *self.state.lock().unwrap() = false;
    }

    pub(crate) fn is_set(&self) -> bool {
        *self.state.lock().unwrap()
    }

    /// Block until the latch is set. Returns whether it was set within the
    /// timeout; `None` waits indefinitely.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut set = self.state.lock().unwrap();
        match timeout {
            None => {
                while !*set {
                    set = self.cond.wait(set).unwrap();
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*set {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self.cond.wait_timeout(set, deadline - now).unwrap();
                    set = guard;
                }
                true
            }
        }
    }
}
