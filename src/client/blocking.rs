//! The blocking client: one synchronous request at a time, collecting the
//! request's informs until its reply arrives or the window expires

use std::{
    ops::Deref,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use crate::{
    client::{device::DeviceClient, ClientConfig, ClientError, ClientHandler, Handlers},
    protocol::Message,
};

#[derive(Default)]
struct Current {
    active: bool,
    /// Cleared when the reply matches so stragglers stop matching
    name: Option<String>,
    mid: Option<u32>,
    informs: Vec<Message>,
    reply: Option<Message>,
    done: bool,
}

impl Current {
    /// A reply or inform belongs to the current request when it carries the
    /// request's message id, or matches its name when no id was assigned
    fn matches(&self, msg: &Message) -> bool {
        if !self.active {
            return false;
        }
        match self.mid {
            Some(mid) => msg.id == Some(mid),
            None => self.name.as_deref() == Some(msg.name.as_str()),
        }
    }
}

struct BlockingState {
    current: Mutex<Current>,
    done: Condvar,
}

struct BlockingHandler {
    state: Arc<BlockingState>,
    base: Box<dyn ClientHandler>,
}

impl ClientHandler for BlockingHandler {
    fn handle_inform(&self, msg: Message) {
        {
            let mut current = self.state.current.lock().unwrap();
            if current.matches(&msg) {
                current.informs.push(msg);
                return;
            }
        }
        self.base.handle_inform(msg);
    }

    fn handle_reply(&self, msg: Message) {
        {
            let mut current = self.state.current.lock().unwrap();
            if current.matches(&msg) {
                current.name = None;
                current.reply = Some(msg);
                current.done = true;
                self.state.done.notify_all();
                return;
            }
        }
        self.base.handle_reply(msg);
    }

    fn handle_request(&self, msg: &Message) -> Option<Message> {
        self.base.handle_request(msg)
    }

    fn notify_connected(&self, connected: bool) {
        self.base.notify_connected(connected);
    }
}

/// A client with a synchronous request API.
///
/// Lifecycle and signal operations ([`DeviceClient::start`],
/// [`DeviceClient::stop`], [`DeviceClient::wait_protocol`], ...) are
/// available through deref.
///
/// ```no_run
/// use katcp_client::client::{BlockingClient, ClientConfig};
/// use katcp_client::protocol::Message;
///
/// let client = BlockingClient::new("localhost", 7147, ClientConfig::default());
/// client.start(Some(std::time::Duration::from_secs(5))).unwrap();
/// let (reply, informs) = client
///     .blocking_request(
///         Message::request("help", Vec::<String>::new()).unwrap(),
///         None,
///         false,
///         None,
///     )
///     .unwrap();
/// println!("{} help informs, reply {}", informs.len(), reply);
/// ```
pub struct BlockingClient {
    device: DeviceClient,
    state: Arc<BlockingState>,
    /// Serializes callers, there is only one current-request slot
    request_mutex: Mutex<()>,
}

impl Deref for BlockingClient {
    type Target = DeviceClient;

    fn deref(&self) -> &DeviceClient {
        &self.device
    }
}

impl BlockingClient {
    pub fn new(host: impl Into<String>, port: u16, config: ClientConfig) -> Self {
        Self::with_handlers(host, port, config, Handlers::new())
    }

    /// Like [`BlockingClient::new`], with a base handler receiving every
    /// message that does not belong to the current request
    pub fn with_handlers(
        host: impl Into<String>,
        port: u16,
        config: ClientConfig,
        base: impl ClientHandler + 'static,
    ) -> Self {
        let state = Arc::new(BlockingState {
            current: Mutex::new(Current::default()),
            done: Condvar::new(),
        });
        let handler = BlockingHandler {
            state: Arc::clone(&state),
            base: Box::new(base),
        };
        Self {
            device: DeviceClient::with_shared_handler(host, port, config, Arc::new(handler)),
            state,
            request_mutex: Mutex::new(()),
        }
    }

    /// Sends a request and blocks until its reply arrives, returning the
    /// reply and the informs collected for the request.
    ///
    /// `timeout: None` uses the configured default window. With `keepalive`
    /// the window restarts as long as each elapsed window delivered at least
    /// one new inform, for requests that stream informs longer than they
    /// need to produce the reply.
    pub fn blocking_request(
        &self,
        msg: Message,
        timeout: Option<Duration>,
        keepalive: bool,
        use_mid: Option<bool>,
    ) -> Result<(Message, Vec<Message>), ClientError> {
        let _guard = self.request_mutex.lock().unwrap();
        let timeout = timeout.or(self.device.config().request_timeout);
        {
            let mut current = self.state.current.lock().unwrap();
            *current = Current {
                active: true,
                name: Some(msg.name.clone()),
                ..Default::default()
            };
        }
        let prepared = match self.device.prepare_request(msg, use_mid) {
            Ok(prepared) => prepared,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };
        // Record the id before the reply can race us through the handler
        self.state.current.lock().unwrap().mid = prepared.id;
        let name = prepared.name.clone();
        if let Err(e) = self.device.send(&prepared) {
            self.reset();
            return Err(e);
        }

        let (matched, reply, informs) = {
            let mut current = self.state.current.lock().unwrap();
            match timeout {
                None => {
                    while !current.done {
                        current = self.state.done.wait(current).unwrap();
                    }
                }
                Some(window) => {
                    let mut seen_informs = 0;
                    loop {
                        let deadline = Instant::now() + window;
                        while !current.done {
                            let now = Instant::now();
                            if now >= deadline {
                                break;
                            }
                            let (guard, _) = self
                                .state
                                .done
                                .wait_timeout(current, deadline - now)
                                .unwrap();
                            current = guard;
                        }
                        if current.done || !keepalive {
                            break;
                        }
                        // Keep waiting only while windows bring new informs
                        if current.informs.len() == seen_informs {
                            break;
                        }
                        seen_informs = current.informs.len();
                    }
                }
            }
            let matched = current.done;
            let reply = current.reply.take();
            let informs = std::mem::take(&mut current.informs);
            *current = Current::default();
            (matched, reply, informs)
        };

        match reply {
            Some(reply) if matched => Ok((reply, informs)),
            _ => Err(ClientError::Timeout {
                name,
                seconds: timeout.unwrap_or_default().as_secs_f64(),
            }),
        }
    }

    fn reset(&self) {
        *self.state.current.lock().unwrap() = Current::default();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::{client::Handlers, protocol::MessageKind};

    fn state() -> Arc<BlockingState> {
        Arc::new(BlockingState {
            current: Mutex::new(Current::default()),
            done: Condvar::new(),
        })
    }

    fn handler(state: &Arc<BlockingState>, base: impl ClientHandler + 'static) -> BlockingHandler {
        BlockingHandler {
            state: Arc::clone(state),
            base: Box::new(base),
        }
    }

    fn arm(state: &BlockingState, name: &str, mid: Option<u32>) {
        *state.current.lock().unwrap() = Current {
            active: true,
            name: Some(name.to_owned()),
            mid,
            ..Default::default()
        };
    }

    #[test]
    fn informs_collect_and_reply_finishes() {
        let state = state();
        let handler = handler(&state, ());
        arm(&state, "x", None);

        handler.handle_inform(Message::inform("x", vec!["one"]).unwrap());
        handler.handle_inform(Message::inform("x", vec!["two"]).unwrap());
        handler.handle_reply(Message::reply("x", vec!["ok"]).unwrap());

        let current = state.current.lock().unwrap();
        assert!(current.done);
        assert_eq!(current.informs.len(), 2);
        assert_eq!(current.reply.as_ref().unwrap().arguments, vec!["ok"]);
    }

    #[test]
    fn stragglers_after_the_reply_fall_through() {
        // SyncSender because the handler table wants Sync callbacks
        let (base_tx, base_rx) = mpsc::sync_channel(16);
        let state = state();
        let handler = handler(
            &state,
            Handlers::new().unhandled_reply(move |m| base_tx.send(m).unwrap()),
        );
        arm(&state, "x", None);

        handler.handle_reply(Message::reply("x", vec!["ok"]).unwrap());
        assert!(base_rx.try_recv().is_err());

        // The name was cleared with the first reply, a second one is not ours
        handler.handle_reply(Message::reply("x", vec!["ok", "again"]).unwrap());
        assert_eq!(base_rx.try_recv().unwrap().arguments, vec!["ok", "again"]);
    }

    #[test]
    fn unrelated_messages_fall_through() {
        let (base_tx, base_rx) = mpsc::sync_channel(16);
        let state = state();
        let handler = handler(
            &state,
            Handlers::new().unhandled_inform(move |m| base_tx.send(m).unwrap()),
        );
        arm(&state, "x", None);

        handler.handle_inform(Message::inform("y", vec!["other"]).unwrap());
        assert_eq!(base_rx.try_recv().unwrap().name, "y");
        assert!(state.current.lock().unwrap().informs.is_empty());
    }

    #[test]
    fn mismatched_ids_fall_through() {
        let state = state();
        let handler = handler(&state, ());
        arm(&state, "x", Some(4));

        // Wrong id, not ours even though the name matches
        handler.handle_inform(
            Message::new(MessageKind::Inform, "x", Some(9), vec!["stray"]).unwrap(),
        );
        let current = state.current.lock().unwrap();
        assert!(current.informs.is_empty());
        assert!(!current.done);
    }

    #[test]
    fn request_without_connection_errors_and_resets() {
        let client = BlockingClient::new("localhost", 7147, ClientConfig::default());
        let err = client
            .blocking_request(
                Message::request("x", Vec::<String>::new()).unwrap(),
                Some(Duration::from_millis(10)),
                false,
                None,
            )
            .unwrap_err();
        assert_eq!(err, ClientError::NotConnected);
        assert!(!client.state.current.lock().unwrap().active);
    }
}
