//! Reconnecting push channel over WebSocket.
//!
//! Frames are `{type, data}` JSON envelopes. Handlers subscribe per event
//! type and run in registration order. A closed connection is retried a
//! bounded number of times with a fixed delay; the counter resets whenever
//! the channel reaches `Open`.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::{wire::Envelope, ChannelError, ChannelOptions};

/// Event type pushed by the server when stock levels change.
pub const INVENTORY_UPDATE: &str = "inventory-update";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

/// Returned by [`PushChannel::on`]; pass to [`PushChannel::off`] to remove
/// the handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Connection {
    state: ChannelState,
    reconnect_attempts: u32,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    supervisor: Option<JoinHandle<()>>,
    /// Bumped by every `connect()`; stale supervisors stop touching state.
    generation: u64,
    stopped: bool,
    /// Reconnect budget spent without an explicit `disconnect()`.
    exhausted: bool,
    /// Sent again after every successful (re)connect.
    resubscribe: Vec<Envelope>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<String, Vec<(SubscriptionId, Handler)>>,
}

struct Inner {
    options: ChannelOptions,
    conn: Mutex<Connection>,
    registry: Mutex<Registry>,
}

/// Shared handle to one push channel. Clones refer to the same connection
/// and the same handler registry.
#[derive(Clone)]
pub struct PushChannel {
    inner: Arc<Inner>,
}

impl fmt::Debug for PushChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let conn = self.inner.conn.lock();
        f.debug_struct("PushChannel")
            .field("url", &self.inner.options.url)
            .field("state", &conn.state)
            .field("reconnect_attempts", &conn.reconnect_attempts)
            .finish()
    }
}

impl PushChannel {
    /// Creates a closed channel. Nothing connects until [`connect`](Self::connect).
    pub fn new(options: ChannelOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                conn: Mutex::new(Connection {
                    state: ChannelState::Closed,
                    reconnect_attempts: 0,
                    outbound: None,
                    supervisor: None,
                    generation: 0,
                    stopped: false,
                    exhausted: false,
                    resubscribe: Vec::new(),
                }),
                registry: Mutex::new(Registry::default()),
            }),
        }
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ChannelState {
        self.inner.conn.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Automatic reconnects since the channel was last open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.conn.lock().reconnect_attempts
    }

    /// `true` once the channel has given up reconnecting on its own. A
    /// `Closed` state alone may just be the pause before the next attempt.
    pub fn is_exhausted(&self) -> bool {
        self.inner.conn.lock().exhausted
    }

    /// Opens the connection and resolves with the outcome of this first
    /// attempt. A failed attempt still enters the reconnect cycle.
    ///
    /// Calling `connect` again replaces any running connection.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let (report, outcome) = oneshot::channel();
        {
            let mut conn = self.inner.conn.lock();
            if let Some(previous) = conn.supervisor.take() {
                previous.abort();
            }
            conn.generation += 1;
            conn.stopped = false;
            conn.exhausted = false;
            conn.outbound = None;
            conn.state = ChannelState::Connecting;
            let task = supervise(Arc::clone(&self.inner), conn.generation, report);
            conn.supervisor = Some(tokio::spawn(task));
        }
        outcome.await.unwrap_or(Err(ChannelError::Superseded))
    }

    /// Closes the connection and stops reconnecting.
    pub fn disconnect(&self) {
        let mut conn = self.inner.conn.lock();
        conn.stopped = true;
        conn.state = ChannelState::Closed;
        match conn.outbound.take() {
            Some(outbound) => {
                let _ = outbound.send(Message::Close(None));
            }
            None => {
                if let Some(supervisor) = conn.supervisor.take() {
                    supervisor.abort();
                }
            }
        }
    }

    /// Sends `{type, data}` if the channel is open. Otherwise logs a warning
    /// and drops the message. Returns whether the message was handed to the
    /// socket.
    pub fn send(&self, kind: &str, data: Value) -> bool {
        let conn = self.inner.conn.lock();
        let outbound = match (&conn.state, &conn.outbound) {
            (ChannelState::Open, Some(outbound)) => outbound,
            _ => {
                tracing::warn!(kind, "push channel is not connected");
                return false;
            }
        };
        match serde_json::to_string(&Envelope::new(kind, data)) {
            Ok(text) => outbound.send(Message::Text(text.into())).is_ok(),
            Err(err) => {
                tracing::warn!(kind, error = %err, "could not encode channel message");
                false
            }
        }
    }

    /// Appends `handler` to the handlers for `event`.
    pub fn on<H>(&self, event: impl Into<String>, handler: H) -> SubscriptionId
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        let mut registry = self.inner.registry.lock();
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry
            .handlers
            .entry(event.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes one handler. Returns whether it was registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut registry = self.inner.registry.lock();
        let mut removed = false;
        for handlers in registry.handlers.values_mut() {
            let before = handlers.len();
            handlers.retain(|(existing, _)| *existing != id);
            removed |= handlers.len() != before;
        }
        registry.handlers.retain(|_, handlers| !handlers.is_empty());
        removed
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.inner
            .registry
            .lock()
            .handlers
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Registers `handler` for inventory pushes and asks the server for
    /// them. The subscribe request is repeated after every reconnect.
    pub fn subscribe_to_inventory_updates<H>(&self, handler: H) -> SubscriptionId
    where
        H: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.on(INVENTORY_UPDATE, handler);
        let request = Envelope::new("subscribe", json!({ "channel": "inventory" }));
        {
            let mut conn = self.inner.conn.lock();
            if !conn.resubscribe.contains(&request) {
                conn.resubscribe.push(request.clone());
            }
        }
        self.send(&request.kind, request.data);
        id
    }

    /// Parses one inbound frame and runs the matching handlers. Returns how
    /// many handlers ran.
    ///
    /// Unparseable frames are logged and dropped. A panicking handler is
    /// logged and does not stop the ones after it.
    pub fn handle_message(&self, raw: &str) -> usize {
        self.inner.dispatch(raw)
    }
}

impl Inner {
    fn dispatch(&self, raw: &str) -> usize {
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                let err = ChannelError::from(err);
                tracing::warn!(error = %err, "dropping channel message");
                return 0;
            }
        };

        let handlers: Vec<Handler> = self
            .registry
            .lock()
            .handlers
            .get(&envelope.kind)
            .map(|list| list.iter().map(|(_, handler)| Arc::clone(handler)).collect())
            .unwrap_or_default();

        for handler in &handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&envelope.data))).is_err() {
                tracing::error!(kind = %envelope.kind, "channel handler panicked");
            }
        }
        handlers.len()
    }

    /// Runs `f` on the connection unless a newer `connect()` took over.
    fn with_current<R>(&self, generation: u64, f: impl FnOnce(&mut Connection) -> R) -> Option<R> {
        let mut conn = self.conn.lock();
        if conn.generation != generation {
            return None;
        }
        Some(f(&mut conn))
    }

    async fn open(&self) -> Result<WsStream, ChannelError> {
        let timeout_ms = self.options.connect_timeout_ms;
        let connecting = tokio_tungstenite::connect_async(self.options.url.as_str());
        match tokio::time::timeout(Duration::from_millis(timeout_ms), connecting).await {
            Ok(Ok((ws, _response))) => Ok(ws),
            Ok(Err(err)) => Err(ChannelError::Connect(err)),
            Err(_) => Err(ChannelError::Timeout(timeout_ms)),
        }
    }

    /// Moves frames both ways until either side closes.
    async fn pump(&self, ws: WsStream, mut outbound: mpsc::UnboundedReceiver<Message>) {
        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.dispatch(text.as_str());
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::warn!(error = %err, "push channel error");
                        break;
                    }
                },
                message = outbound.recv() => match message {
                    Some(message) => {
                        let closing = matches!(message, Message::Close(_));
                        if let Err(err) = sink.send(message).await {
                            tracing::warn!(error = %err, "push channel send failed");
                            break;
                        }
                        if closing {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }
}

/// Connection loop for one `connect()` call: attempt, pump, and retry with a
/// fixed delay until the reconnect budget is spent or the channel is stopped.
async fn supervise(
    inner: Arc<Inner>,
    generation: u64,
    report: oneshot::Sender<Result<(), ChannelError>>,
) {
    let mut report = Some(report);
    let max_attempts = inner.options.max_reconnect_attempts;
    let delay = Duration::from_millis(inner.options.reconnect_delay_ms);

    loop {
        let proceed = inner.with_current(generation, |conn| {
            if conn.stopped {
                return false;
            }
            conn.state = ChannelState::Connecting;
            true
        });
        if proceed != Some(true) {
            return;
        }

        match inner.open().await {
            Ok(ws) => {
                let (outbound, receiver) = mpsc::unbounded_channel();
                let opened = inner.with_current(generation, |conn| {
                    conn.state = ChannelState::Open;
                    conn.reconnect_attempts = 0;
                    for request in &conn.resubscribe {
                        if let Ok(text) = serde_json::to_string(request) {
                            let _ = outbound.send(Message::Text(text.into()));
                        }
                    }
                    conn.outbound = Some(outbound);
                });
                if opened.is_none() {
                    return;
                }
                tracing::info!(url = %inner.options.url, "push channel connected");
                if let Some(report) = report.take() {
                    let _ = report.send(Ok(()));
                }

                inner.pump(ws, receiver).await;
                tracing::info!("push channel disconnected");
            }
            Err(err) => {
                tracing::warn!(error = %err, "push channel connect failed");
                if let Some(report) = report.take() {
                    let _ = report.send(Err(err));
                }
            }
        }

        let next = inner.with_current(generation, |conn| {
            conn.state = ChannelState::Closed;
            conn.outbound = None;
            if conn.stopped {
                return None;
            }
            if conn.reconnect_attempts >= max_attempts {
                conn.exhausted = true;
                return None;
            }
            conn.reconnect_attempts += 1;
            Some(conn.reconnect_attempts)
        });
        let Some(Some(attempt)) = next else {
            if next.is_some() {
                tracing::info!("push channel stays closed");
            }
            return;
        };

        tracing::info!(attempt, max_attempts, "attempting to reconnect");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::{json, Value};

    use super::{ChannelState, PushChannel};
    use crate::ChannelOptions;

    fn channel() -> PushChannel {
        PushChannel::new(ChannelOptions::with_url("ws://127.0.0.1:9"))
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let channel = channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second"] {
            let seen = Arc::clone(&seen);
            channel.on("inventory-update", move |data: &Value| {
                seen.lock().push((name, data.clone()));
            });
        }

        let ran = channel.handle_message(r#"{"type":"inventory-update","data":{"O+":40}}"#);

        assert_eq!(ran, 2);
        assert_eq!(
            *seen.lock(),
            vec![("first", json!({"O+": 40})), ("second", json!({"O+": 40}))]
        );
    }

    #[test]
    fn unparseable_frame_runs_nothing_and_keeps_handlers() {
        let channel = channel();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        channel.on("inventory-update", move |_: &Value| *counter.lock() += 1);

        assert_eq!(channel.handle_message("not json {"), 0);
        assert_eq!(channel.handle_message(r#"{"data":1}"#), 0);
        assert_eq!(*calls.lock(), 0);
        assert_eq!(channel.handler_count("inventory-update"), 1);

        channel.handle_message(r#"{"type":"inventory-update","data":null}"#);
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn panicking_handler_does_not_block_later_ones() {
        let channel = channel();
        let reached = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&reached);
        channel.on("alert", |_: &Value| panic!("handler bug"));
        channel.on("alert", move |_: &Value| *flag.lock() = true);

        assert_eq!(channel.handle_message(r#"{"type":"alert","data":{}}"#), 2);
        assert!(*reached.lock());
    }

    #[test]
    fn other_event_types_are_not_dispatched() {
        let channel = channel();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        channel.on("inventory-update", move |_: &Value| *counter.lock() += 1);

        assert_eq!(channel.handle_message(r#"{"type":"news","data":1}"#), 0);
        assert_eq!(*calls.lock(), 0);
    }

    #[test]
    fn off_removes_only_that_handler() {
        let channel = channel();
        let first = channel.on("x", |_: &Value| {});
        let _second = channel.on("x", |_: &Value| {});

        assert!(channel.off(first));
        assert!(!channel.off(first));
        assert_eq!(channel.handler_count("x"), 1);
    }

    #[test]
    fn send_while_closed_is_a_noop() {
        let channel = channel();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(!channel.is_exhausted());
        assert!(!channel.send("subscribe", json!({"channel": "inventory"})));
    }

    #[test]
    fn inventory_subscription_registers_handler_even_when_closed() {
        let channel = channel();
        channel.subscribe_to_inventory_updates(|_: &Value| {});
        channel.subscribe_to_inventory_updates(|_: &Value| {});
        assert_eq!(channel.handler_count("inventory-update"), 2);
        assert_eq!(channel.inner.conn.lock().resubscribe.len(), 1);
    }
}
