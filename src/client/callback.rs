//! The callback-based client: many concurrent requests correlated by
//! message id, or by request name in submission order on pre-v5 servers

use std::{
    collections::{HashMap, VecDeque},
    ops::Deref,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex},
    time::Duration,
};

use log::error;

use crate::{
    arguments::{RetCode, ToKatcpArgument},
    client::{
        device::{panic_message, DeviceClient},
        timer::TimerScheduler,
        ClientConfig, ClientError, ClientHandler, Handlers,
    },
    protocol::{Message, MessageKind},
};

/// Grace period the blocking façade waits beyond the request timeout before
/// concluding the dispatcher itself has stalled
const EXTRA_WAIT: Duration = Duration::from_secs(5);

/// Consumed with the reply (or the synthetic failure standing in for it)
pub type ReplyCallback = Box<dyn FnOnce(Message) + Send>;
/// Invoked for every inform belonging to the request
pub type InformCallback = Box<dyn Fn(Message) + Send + Sync>;

type SharedInformCallback = Arc<dyn Fn(Message) + Send + Sync>;

struct PendingRequest {
    request: Message,
    reply_cb: Option<ReplyCallback>,
    inform_cb: Option<SharedInformCallback>,
    timeout: Option<Duration>,
}

/// Outstanding requests, indexed for both correlation schemes.
///
/// Every request gets an internal token. Requests carrying a message id are
/// additionally reachable through `by_mid`; `by_name` keeps per-name
/// submission order so bare replies and informs match the oldest
/// outstanding request of that name.
#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, PendingRequest>,
    by_mid: HashMap<u32, u64>,
    by_name: HashMap<String, VecDeque<u64>>,
    next_token: u64,
}

impl PendingTable {
    fn push(&mut self, request: PendingRequest) -> u64 {
        self.next_token += 1;
        let token = self.next_token;
        if let Some(mid) = request.request.id {
            self.by_mid.insert(mid, token);
        }
        self.by_name
            .entry(request.request.name.clone())
            .or_default()
            .push_back(token);
        self.entries.insert(token, request);
        token
    }

    fn remove(&mut self, token: u64) -> Option<PendingRequest> {
        let request = self.entries.remove(&token)?;
        if let Some(mid) = request.request.id {
            self.by_mid.remove(&mid);
        }
        if let Some(stack) = self.by_name.get_mut(&request.request.name) {
            stack.retain(|t| *t != token);
            if stack.is_empty() {
                self.by_name.remove(&request.request.name);
            }
        }
        Some(request)
    }

    /// Pops the request a reply belongs to: by message id when the reply
    /// carries one, otherwise the oldest id-less request with that name
    fn pop_for_reply(&mut self, msg: &Message) -> Option<(u64, PendingRequest)> {
        let token = match msg.id {
            Some(mid) => self.by_mid.get(&mid).copied(),
            None => self
                .by_name
                .get(&msg.name)?
                .iter()
                .copied()
                .find(|t| self.entries.get(t).map_or(false, |r| r.request.id.is_none())),
        }?;
        self.remove(token).map(|request| (token, request))
    }

    /// The inform callback of the request an inform belongs to, without
    /// consuming the entry. An id mismatch in either direction leaves the
    /// inform unmatched.
    fn inform_callback(&self, msg: &Message) -> Option<SharedInformCallback> {
        let entry = match msg.id {
            Some(mid) => self.by_mid.get(&mid).and_then(|t| self.entries.get(t))?,
            None => {
                let token = self.by_name.get(&msg.name)?.front()?;
                let entry = self.entries.get(token)?;
                if entry.request.id.is_some() {
                    return None;
                }
                entry
            }
        };
        entry.inform_cb.clone()
    }

    fn drain(&mut self) -> Vec<(u64, PendingRequest)> {
        self.by_mid.clear();
        self.by_name.clear();
        self.entries.drain().collect()
    }
}

struct CallbackState {
    pending: Mutex<PendingTable>,
}

impl CallbackState {
    /// The request timer expired. Pops the entry and delivers a synthetic
    /// failure reply; a reply that raced us here already popped it and this
    /// does nothing.
    fn fire_timeout(&self, token: u64) {
        let request = self.pending.lock().unwrap().remove(token);
        if let Some(request) = request {
            let seconds = request.timeout.map(|t| t.as_secs_f64()).unwrap_or_default();
            let reply = fail_reply(
                &request.request,
                format!("Timed out after {} seconds", seconds),
            );
            if let Some(cb) = request.reply_cb {
                invoke_reply(cb, reply);
            }
        }
    }
}

struct CallbackHandler {
    state: Arc<CallbackState>,
    timers: Arc<TimerScheduler>,
    base: Box<dyn ClientHandler>,
}

impl ClientHandler for CallbackHandler {
    fn handle_inform(&self, msg: Message) {
        let cb = self.state.pending.lock().unwrap().inform_callback(&msg);
        match cb {
            Some(cb) => invoke_inform(&cb, msg),
            None => self.base.handle_inform(msg),
        }
    }

    fn handle_reply(&self, msg: Message) {
        let popped = self.state.pending.lock().unwrap().pop_for_reply(&msg);
        match popped {
            Some((token, request)) => {
                self.timers.cancel(token);
                match request.reply_cb {
                    Some(cb) => invoke_reply(cb, msg),
                    None => self.base.handle_reply(msg),
                }
            }
            None => self.base.handle_reply(msg),
        }
    }

    fn handle_request(&self, msg: &Message) -> Option<Message> {
        self.base.handle_request(msg)
    }

    fn notify_connected(&self, connected: bool) {
        self.base.notify_connected(connected);
    }
}

/// A client that correlates many concurrent requests and hands each reply
/// and inform to per-request callbacks.
///
/// Lifecycle and signal operations ([`DeviceClient::start`],
/// [`DeviceClient::wait_protocol`], ...) are available through deref;
/// `stop` and `join` are overridden here to also drain outstanding requests
/// and the timer thread.
///
/// ```no_run
/// use katcp_client::client::{CallbackClient, ClientConfig};
/// use katcp_client::protocol::Message;
///
/// let client = CallbackClient::new("localhost", 7147, ClientConfig::default());
/// client.start(Some(std::time::Duration::from_secs(5))).unwrap();
/// client
///     .request(
///         Message::request("watchdog", Vec::<String>::new()).unwrap(),
///         Some(Box::new(|reply| println!("got {}", reply))),
///         None,
///         None,
///         None,
///     )
///     .unwrap();
/// ```
pub struct CallbackClient {
    device: DeviceClient,
    state: Arc<CallbackState>,
    timers: Arc<TimerScheduler>,
    handler: Arc<CallbackHandler>,
}

impl Deref for CallbackClient {
    type Target = DeviceClient;

    fn deref(&self) -> &DeviceClient {
        &self.device
    }
}

impl CallbackClient {
    pub fn new(host: impl Into<String>, port: u16, config: ClientConfig) -> Self {
        Self::with_handlers(host, port, config, Handlers::new())
    }

    /// Like [`CallbackClient::new`], with a base handler receiving every
    /// message that does not belong to an outstanding request
    pub fn with_handlers(
        host: impl Into<String>,
        port: u16,
        config: ClientConfig,
        base: impl ClientHandler + 'static,
    ) -> Self {
        let state = Arc::new(CallbackState {
            pending: Mutex::new(PendingTable::default()),
        });
        let timers = Arc::new(TimerScheduler::new({
            // Weak so the scheduler thread does not keep the table alive
            let state = Arc::downgrade(&state);
            move |token| {
                if let Some(state) = state.upgrade() {
                    state.fire_timeout(token);
                }
            }
        }));
        let handler = Arc::new(CallbackHandler {
            state: Arc::clone(&state),
            timers: Arc::clone(&timers),
            base: Box::new(base),
        });
        let device = DeviceClient::with_shared_handler(
            host,
            port,
            config,
            Arc::clone(&handler) as Arc<dyn ClientHandler>,
        );
        Self {
            device,
            state,
            timers,
            handler,
        }
    }

    /// Sends a request, delivering its reply to `reply_cb` and its informs
    /// to `inform_cb`.
    ///
    /// The reply callback always fires exactly once: with the server's
    /// reply, with `!<name> fail ...` when the timeout expires or the send
    /// fails, or with a failure at [`CallbackClient::stop`]. A `timeout` of
    /// `None` uses the configured default. Using an explicit message id with
    /// a server that does not support them fails with
    /// [`ClientError::Version`] without invoking any callback.
    pub fn request(
        &self,
        msg: Message,
        reply_cb: Option<ReplyCallback>,
        inform_cb: Option<InformCallback>,
        timeout: Option<Duration>,
        use_mid: Option<bool>,
    ) -> Result<(), ClientError> {
        let timeout = timeout.or(self.device.config().request_timeout);
        let msg = self.device.prepare_request(msg, use_mid)?;
        // A failed send still books the request, the synthetic failure then
        // pops its own entry through the normal reply path
        let failure = self
            .device
            .send(&msg)
            .err()
            .map(|e| fail_reply(&msg, e.to_string()));
        let token = {
            let mut table = self.state.pending.lock().unwrap();
            table.push(PendingRequest {
                request: msg,
                reply_cb,
                inform_cb: inform_cb.map(SharedInformCallback::from),
                timeout,
            })
        };
        if let Some(delay) = timeout {
            self.timers.schedule(token, delay);
        }
        if let Some(reply) = failure {
            self.handler.handle_reply(reply);
        }
        Ok(())
    }

    /// A blocking request on top of the callback machinery.
    ///
    /// Returns the reply (which may be a synthetic `fail`) and the informs
    /// collected for the request. Waits a grace period beyond the request
    /// timeout; [`ClientError::ReplyOverdue`] after that means the reply
    /// callback was never invoked at all.
    pub fn blocking_request(
        &self,
        msg: Message,
        timeout: Option<Duration>,
        use_mid: Option<bool>,
    ) -> Result<(Message, Vec<Message>), ClientError> {
        let timeout = timeout.or(self.device.config().request_timeout);
        let (reply_tx, reply_rx) = oneshot::channel();
        let informs = Arc::new(Mutex::new(Vec::new()));
        let collected = Arc::clone(&informs);
        self.request(
            msg,
            Some(Box::new(move |reply| {
                let _ = reply_tx.send(reply);
            })),
            Some(Box::new(move |inform| {
                collected.lock().unwrap().push(inform);
            })),
            timeout,
            use_mid,
        )?;
        let reply = match timeout {
            Some(timeout) => reply_rx
                .recv_timeout(timeout + EXTRA_WAIT)
                .map_err(|_| ClientError::ReplyOverdue)?,
            None => reply_rx.recv().map_err(|_| ClientError::ReplyOverdue)?,
        };
        let informs = std::mem::take(&mut *informs.lock().unwrap());
        Ok((reply, informs))
    }

    /// Stops the I/O loop and fails every outstanding request with
    /// `!<name> fail Client stopped before reply was received`
    pub fn stop(&self, timeout: Option<Duration>) -> Result<(), ClientError> {
        self.device.stop(timeout)?;
        self.drain_pending();
        Ok(())
    }

    /// Joins the timer thread and the I/O thread. Call after
    /// [`CallbackClient::stop`].
    pub fn join(&self, timeout: Option<Duration>) -> Result<bool, ClientError> {
        self.timers.shutdown();
        let timers_done = self.timers.join(timeout);
        let device_done = self.device.join(timeout)?;
        Ok(timers_done && device_done)
    }

    fn drain_pending(&self) {
        let drained = self.state.pending.lock().unwrap().drain();
        for (token, request) in drained {
            self.timers.cancel(token);
            let reply = fail_reply(&request.request, ClientError::Stopped.to_string());
            if let Some(cb) = request.reply_cb {
                invoke_reply(cb, reply);
            }
        }
    }
}

/// A synthetic `!<name> fail <reason>` standing in for a reply the server
/// never sent, carrying the request's message id
fn fail_reply(request: &Message, reason: String) -> Message {
    Message {
        kind: MessageKind::Reply,
        name: request.name.clone(),
        id: request.id,
        arguments: vec![RetCode::Fail.to_argument(), reason],
    }
}

fn invoke_reply(cb: ReplyCallback, msg: Message) {
    let name = msg.name.clone();
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || cb(msg))) {
        error!(
            "reply {} callback panicked: {}",
            name,
            panic_message(&payload)
        );
    }
}

fn invoke_inform(cb: &SharedInformCallback, msg: Message) {
    let name = msg.name.clone();
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || cb(msg))) {
        error!(
            "inform {} callback panicked: {}",
            name,
            panic_message(&payload)
        );
    }
}
