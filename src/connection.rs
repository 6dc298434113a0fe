//! Bidirectional connection plumbing over a message channel.
//!
//! A connection multiplexes outbound calls by id, routes inbound frames
//! into the dispatch context, forwards reply events back to the wire and
//! carries event subscriptions in both directions. One blocking reader
//! thread per connection preserves per-connection inbound order: each
//! frame is fully processed before the next is read.

use std::collections::{HashMap, HashSet};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::codec;
use crate::error::Error;
use crate::service::{Call, CallEvent, Context, Sink, DEFAULT_INTERFACE};
use crate::transport::socket::SocketTransport;
use crate::transport::{Credentials, Listener, MessageChannel, Transport};
use crate::typing::{serialize, Registry};
use crate::value::Value;

type SubKey = (String, String, String);

pub(crate) struct ConnectionShared {
    channel: Box<dyn MessageChannel>,
    context: Option<Context>,
    registry: RwLock<Option<Arc<Registry>>>,
    next_id: AtomicU64,
    /// Outbound calls awaiting reply events, by wire id.
    pending: Mutex<HashMap<u64, mpsc::Sender<CallEvent>>>,
    /// Inbound calls still live, kept addressable for abort frames.
    inbound: Mutex<HashMap<u64, Call>>,
    /// (path, interface, name) triples the peer subscribed to.
    remote_subscriptions: Mutex<HashSet<SubKey>>,
    /// Local event sinks by subscription triple.
    local_subscriptions: Mutex<HashMap<SubKey, mpsc::Sender<Value>>>,
    credentials: Mutex<Option<Credentials>>,
    closed: AtomicBool,
}

impl ConnectionShared {
    fn send_envelope(&self, envelope: Value) -> Result<(), Error> {
        let (payload, fds) = codec::encode(&envelope)?;
        let raw: Vec<_> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        self.channel.send_msg(&payload, &raw)
        // `fds` drop here, closing the duplicates made for this frame.
    }

    fn send_call_event(&self, id: u64, event: CallEvent) {
        let envelope = match event {
            CallEvent::Reply(value) => Value::dictionary_from([
                ("op", Value::string("reply")),
                ("id", Value::uint64(id)),
                ("value", serialize(&value)),
            ]),
            CallEvent::Error(value) => Value::dictionary_from([
                ("op", Value::string("error")),
                ("id", Value::uint64(id)),
                ("value", serialize(&value)),
            ]),
            CallEvent::Fragment { seq, value } => Value::dictionary_from([
                ("op", Value::string("fragment")),
                ("id", Value::uint64(id)),
                ("seq", Value::uint64(seq)),
                ("value", serialize(&value)),
            ]),
            CallEvent::End => Value::dictionary_from([
                ("op", Value::string("end")),
                ("id", Value::uint64(id)),
            ]),
        };
        if let Err(error) = self.send_envelope(envelope) {
            warn!(id, %error, "failed to send reply frame");
        }
    }

    /// Forwards an event to the peer if it holds a matching subscription.
    pub(crate) fn notify_event(&self, path: &str, interface: &str, name: &str, payload: &Value) {
        let key = (path.to_string(), interface.to_string(), name.to_string());
        if !self.remote_subscriptions.lock().contains(&key) {
            return;
        }
        let envelope = Value::dictionary_from([
            ("op", Value::string("event")),
            ("path", Value::string(path)),
            ("interface", Value::string(interface)),
            ("name", Value::string(name)),
            ("value", serialize(payload)),
        ]);
        if let Err(error) = self.send_envelope(envelope) {
            warn!(path, interface, name, %error, "failed to send event frame");
        }
    }

    /// Connection loss: fail every outbound call, flag every inbound call
    /// as aborted and wake event streams.
    fn teardown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders wakes the receivers with a closed error.
        self.pending.lock().clear();
        self.local_subscriptions.lock().clear();
        for (_, call) in self.inbound.lock().drain() {
            call.abort();
        }
    }
}

/// A live connection to a peer. Cheap to clone; the reader thread and
/// in-flight calls keep the shared state alive until the peer goes away
/// or [`Connection::close`] runs.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionShared>,
}

impl Connection {
    /// Connects to a listening peer, e.g. `unix:///run/svc.sock` or
    /// `tcp://127.0.0.1:5000`.
    pub fn connect(uri: &str) -> Result<Connection, Error> {
        Connection::connect_with(uri, None)
    }

    /// Connects with a dispatch context, allowing the peer to call back
    /// into locally registered instances.
    pub fn connect_with(uri: &str, context: Option<Context>) -> Result<Connection, Error> {
        let channel = SocketTransport.connect(uri)?;
        Ok(Connection::from_channel(channel, context))
    }

    /// Wraps an established message channel. Used by servers for accepted
    /// connections and by tests over socketpairs.
    pub fn from_channel(channel: Box<dyn MessageChannel>, context: Option<Context>) -> Connection {
        let registry = context.as_ref().and_then(|c| c.registry());
        let inner = Arc::new(ConnectionShared {
            channel,
            context,
            registry: RwLock::new(registry),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            inbound: Mutex::new(HashMap::new()),
            remote_subscriptions: Mutex::new(HashSet::new()),
            local_subscriptions: Mutex::new(HashMap::new()),
            credentials: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        if let Some(context) = &inner.context {
            context.shared().register_connection(Arc::downgrade(&inner));
        }

        let reader = Arc::clone(&inner);
        thread::spawn(move || reader_loop(reader));

        Connection { inner }
    }

    /// Attaches a registry used to deserialise typed values arriving on
    /// this connection.
    pub fn set_registry(&self, registry: Arc<Registry>) {
        *self.inner.registry.write() = Some(registry);
    }

    /// Credentials of the peer process, once the first message carrying
    /// them has arrived.
    pub fn peer_credentials(&self) -> Option<Credentials> {
        *self.inner.credentials.lock()
    }

    /// Starts a call on the peer. The returned handle observes the reply
    /// events and can abort the call.
    pub fn call(
        &self,
        path: &str,
        interface: Option<&str>,
        method: &str,
        args: Value,
    ) -> Result<ClientCall, Error> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel();
        self.inner.pending.lock().insert(id, tx);

        let envelope = Value::dictionary_from([
            ("op", Value::string("call")),
            ("id", Value::uint64(id)),
            ("path", Value::string(path)),
            (
                "interface",
                Value::string(interface.unwrap_or(DEFAULT_INTERFACE)),
            ),
            ("method", Value::string(method)),
            ("args", serialize(&args)),
        ]);

        if let Err(error) = self.inner.send_envelope(envelope) {
            self.inner.pending.lock().remove(&id);
            return Err(error);
        }

        Ok(ClientCall {
            id,
            conn: Arc::clone(&self.inner),
            rx,
        })
    }

    /// Subscribes to events emitted from `(path, interface, name)` on the
    /// peer. Dropping the stream does not unsubscribe; pair it with
    /// [`Connection::unsubscribe`].
    pub fn subscribe(
        &self,
        path: &str,
        interface: &str,
        name: &str,
    ) -> Result<EventStream, Error> {
        let key = (path.to_string(), interface.to_string(), name.to_string());
        let (tx, rx) = mpsc::channel();
        self.inner.local_subscriptions.lock().insert(key, tx);
        self.inner.send_envelope(Value::dictionary_from([
            ("op", Value::string("subscribe")),
            ("path", Value::string(path)),
            ("interface", Value::string(interface)),
            ("name", Value::string(name)),
        ]))?;
        Ok(EventStream { rx })
    }

    pub fn unsubscribe(&self, path: &str, interface: &str, name: &str) -> Result<(), Error> {
        let key = (path.to_string(), interface.to_string(), name.to_string());
        self.inner.local_subscriptions.lock().remove(&key);
        self.inner.send_envelope(Value::dictionary_from([
            ("op", Value::string("unsubscribe")),
            ("path", Value::string(path)),
            ("interface", Value::string(interface)),
            ("name", Value::string(name)),
        ]))
    }

    /// Closes the connection, failing in-flight calls on both sides.
    pub fn close(&self) {
        self.inner.teardown();
        let _ = self.inner.channel.abort();
    }
}

/// An outbound call in flight.
pub struct ClientCall {
    id: u64,
    conn: Arc<ConnectionShared>,
    rx: mpsc::Receiver<CallEvent>,
}

impl ClientCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Blocks for the next reply event.
    pub fn recv(&self) -> Result<CallEvent, Error> {
        self.rx.recv().map_err(|_| Error::ConnectionClosed)
    }

    /// Waits for a singular reply, converting an error reply into
    /// [`Error::Remote`].
    pub fn wait(&self) -> Result<Value, Error> {
        match self.recv()? {
            CallEvent::Reply(value) => Ok(value),
            CallEvent::Error(error) => Err(Error::Remote(error)),
            CallEvent::Fragment { .. } | CallEvent::End => {
                Err(Error::CallState("streaming reply to a singular wait"))
            }
        }
    }

    /// Collects a full streaming response in fragment order.
    pub fn collect_stream(&self) -> Result<Vec<Value>, Error> {
        let mut out = Vec::new();
        loop {
            match self.recv()? {
                CallEvent::Fragment { value, .. } => out.push(value),
                CallEvent::End => return Ok(out),
                CallEvent::Error(error) => return Err(Error::Remote(error)),
                CallEvent::Reply(_) => {
                    return Err(Error::CallState("singular reply in a stream"))
                }
            }
        }
    }

    /// Asks the peer to abort the call. Cancellation stays cooperative:
    /// the handler keeps running until it observes the flag.
    pub fn abort(&self) -> Result<(), Error> {
        self.conn.send_envelope(Value::dictionary_from([
            ("op", Value::string("abort")),
            ("id", Value::uint64(self.id)),
        ]))
    }
}

impl Drop for ClientCall {
    fn drop(&mut self) {
        self.conn.pending.lock().remove(&self.id);
    }
}

/// Receives the payloads of one event subscription.
pub struct EventStream {
    rx: mpsc::Receiver<Value>,
}

impl EventStream {
    pub fn recv(&self) -> Result<Value, Error> {
        self.rx.recv().map_err(|_| Error::ConnectionClosed)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Value, Error> {
        self.rx
            .recv_timeout(timeout)
            .map_err(|_| Error::ConnectionClosed)
    }
}

fn reader_loop(shared: Arc<ConnectionShared>) {
    loop {
        let frame = match shared.channel.recv_msg() {
            Ok(frame) => frame,
            Err(error) => {
                debug!(%error, "connection reader stopping");
                break;
            }
        };

        if let Some(credentials) = frame.credentials {
            let mut slot = shared.credentials.lock();
            if slot.is_none() {
                *slot = Some(credentials);
            }
        }

        let value = match codec::decode(&frame.payload, frame.fds) {
            Ok(value) => value,
            Err(error) => {
                warn!(%error, "dropping undecodable frame");
                break;
            }
        };

        if let Err(error) = handle_frame(&shared, &value) {
            warn!(%error, "dropping bad frame");
        }
    }
    shared.teardown();
}

fn frame_id(value: &Value) -> Result<u64, Error> {
    value
        .dict_get("id")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::Protocol("frame without call id".into()))
}

fn frame_str<'a>(value: &'a Value, key: &str) -> Result<&'a str, Error> {
    value
        .dict_get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Protocol(format!("frame without '{}'", key)))
}

fn sub_key(value: &Value) -> Result<SubKey, Error> {
    Ok((
        frame_str(value, "path")?.to_string(),
        frame_str(value, "interface")?.to_string(),
        frame_str(value, "name")?.to_string(),
    ))
}

fn handle_frame(shared: &Arc<ConnectionShared>, value: &Value) -> Result<(), Error> {
    let op = frame_str(value, "op")?;
    match op {
        "call" => handle_call(shared, value),
        "reply" | "error" | "fragment" | "end" => handle_reply(shared, op, value),
        "abort" => {
            let id = frame_id(value)?;
            if let Some(call) = shared.inbound.lock().get(&id) {
                call.abort();
            }
            Ok(())
        }
        "subscribe" => {
            shared.remote_subscriptions.lock().insert(sub_key(value)?);
            Ok(())
        }
        "unsubscribe" => {
            shared.remote_subscriptions.lock().remove(&sub_key(value)?);
            Ok(())
        }
        "event" => {
            let key = sub_key(value)?;
            let mut payload = value.dict_get("value").cloned().unwrap_or_else(Value::null);
            if let Some(registry) = shared.registry.read().clone() {
                payload = registry.deserialize(&payload)?;
            }
            if let Some(tx) = shared.local_subscriptions.lock().get(&key) {
                let _ = tx.send(payload);
            }
            Ok(())
        }
        other => Err(Error::Protocol(format!("unknown frame op '{}'", other))),
    }
}

fn handle_call(shared: &Arc<ConnectionShared>, value: &Value) -> Result<(), Error> {
    let id = frame_id(value)?;
    let path = value
        .dict_get("path")
        .and_then(Value::as_str)
        .unwrap_or("/")
        .to_string();
    let interface = value
        .dict_get("interface")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_INTERFACE)
        .to_string();
    let method = frame_str(value, "method")?.to_string();
    let mut args = value.dict_get("args").cloned().unwrap_or_else(Value::null);

    let Some(context) = shared.context.clone() else {
        shared.send_call_event(
            id,
            CallEvent::Error(Error::NotFound("no dispatch context on this side".into()).to_value()),
        );
        return Ok(());
    };

    if let Some(registry) = shared.registry.read().clone() {
        match registry.deserialize(&args) {
            Ok(typed) => args = typed,
            Err(error) => {
                shared.send_call_event(id, CallEvent::Error(error.to_value()));
                return Ok(());
            }
        }
    }

    let weak = Arc::downgrade(shared);
    let sink: Sink = Box::new(move |event| {
        if let Some(conn) = weak.upgrade() {
            let terminal = matches!(
                event,
                CallEvent::Reply(_) | CallEvent::Error(_) | CallEvent::End
            );
            conn.send_call_event(id, event);
            if terminal {
                conn.inbound.lock().remove(&id);
            }
        }
    });

    match context.dispatch(&path, &interface, &method, args, sink) {
        Ok(call) => {
            if !call.is_terminal() {
                shared.inbound.lock().insert(id, call.clone());
                // The handler may have terminated asynchronously between
                // the check and the insert.
                if call.is_terminal() {
                    shared.inbound.lock().remove(&id);
                }
            }
            Ok(())
        }
        Err(error) => {
            shared.send_call_event(id, CallEvent::Error(error.to_value()));
            Ok(())
        }
    }
}

fn handle_reply(shared: &Arc<ConnectionShared>, op: &str, value: &Value) -> Result<(), Error> {
    let id = frame_id(value)?;
    let mut payload = value.dict_get("value").cloned().unwrap_or_else(Value::null);
    if op != "end" {
        if let Some(registry) = shared.registry.read().clone() {
            payload = registry.deserialize(&payload)?;
        }
    }

    let (event, terminal) = match op {
        "reply" => (CallEvent::Reply(payload), true),
        "error" => (CallEvent::Error(payload), true),
        "end" => (CallEvent::End, true),
        "fragment" => {
            let seq = value.dict_get("seq").and_then(Value::as_u64).unwrap_or(0);
            (CallEvent::Fragment { seq, value: payload }, false)
        }
        _ => return Err(Error::Protocol(format!("unexpected reply op '{}'", op))),
    };

    let mut pending = shared.pending.lock();
    match pending.get(&id) {
        Some(tx) => {
            let _ = tx.send(event);
            if terminal {
                pending.remove(&id);
            }
        }
        None => warn!(id, op, "reply frame for unknown call"),
    }
    Ok(())
}

/// Accept loop wrapper: owns the listener and the connections it spawned.
pub struct Server {
    listener: Arc<dyn Listener>,
    connections: Arc<Mutex<Vec<Connection>>>,
    uri: String,
}

impl Server {
    /// Binds `uri` and serves `context` to every inbound connection.
    pub fn listen(uri: &str, context: &Context) -> Result<Server, Error> {
        let listener: Arc<dyn Listener> = Arc::from(SocketTransport.listen(uri)?);
        let uri = listener.local_uri();
        let connections = Arc::new(Mutex::new(Vec::new()));

        let accept_listener = Arc::clone(&listener);
        let accept_connections = Arc::clone(&connections);
        let accept_context = context.clone();
        thread::spawn(move || loop {
            match accept_listener.accept() {
                Ok(channel) => {
                    let connection =
                        Connection::from_channel(channel, Some(accept_context.clone()));
                    accept_connections.lock().push(connection);
                }
                Err(error) => {
                    debug!(%error, "accept loop stopping");
                    break;
                }
            }
        });

        Ok(Server {
            listener,
            connections,
            uri,
        })
    }

    /// The bound URI, with the actual port filled in for `tcp://...:0`.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Stops accepting and closes every live connection.
    pub fn close(&self) {
        let _ = self.listener.close();
        for connection in self.connections.lock().drain(..) {
            connection.close();
        }
    }
}
