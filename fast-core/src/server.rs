//! Server side of Fast connections: accepts streams from a listening
//! transport, routes inbound requests to registered handlers by method
//! name, and gives each handler a response writer bound to the right
//! connection and msgid.
//!
//! Handlers run as spawned tasks, so requests on one connection execute
//! concurrently; ordering is enforced only per msgid. All responses for a
//! connection funnel through one bounded channel into the transport, which
//! is how transport backpressure reaches every handler on the connection.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::*;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{MessageDecoder, MessageEncoder};
use crate::crc::CrcMode;
use crate::error::{FastError, FastReason, FastResult, HandlerError};
use crate::message::{FastMessage, FastMessageData, MessageStatus};
use crate::Collector;

/// Outbound messages that may queue per connection before responders wait
/// on the writer task.
const SEND_QUEUE_DEPTH: usize = 32;

/// Server construction options.
#[derive(Clone)]
pub struct ServerOptions {
    /// CRC variant(s) accepted from clients. In the dual-accept default,
    /// responses mirror whichever variant each request validated under.
    pub crc_mode: CrcMode,

    /// Optional metrics sink.
    pub collector: Option<Arc<dyn Collector>>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            crc_mode: CrcMode::V1V2,
            collector: None,
        }
    }
}

/// A registered RPC method implementation.
///
/// The handler may call `write` any number of times and at most one of
/// `end`/`fail`; a handler that returns without terminating gets an
/// implicit empty `end` on `Ok` and an implicit `fail` on `Err`.
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn invoke(
        &self,
        writer: &mut ResponseWriter,
        args: Vec<Value>,
    ) -> Result<(), HandlerError>;
}

/// Accepting side of a server transport, generic over TCP and Unix
/// listeners.
#[async_trait]
pub trait Listener: Send {
    type Stream: AsyncRead + AsyncWrite + Send + 'static;

    async fn accept(&mut self) -> io::Result<Self::Stream>;
}

#[async_trait]
impl Listener for tokio::net::TcpListener {
    type Stream = tokio::net::TcpStream;

    async fn accept(&mut self) -> io::Result<Self::Stream> {
        Ok(tokio::net::TcpListener::accept(self).await?.0)
    }
}

#[cfg(unix)]
#[async_trait]
impl Listener for tokio::net::UnixListener {
    type Stream = tokio::net::UnixStream;

    async fn accept(&mut self) -> io::Result<Self::Stream> {
        Ok(tokio::net::UnixListener::accept(self).await?.0)
    }
}

struct Registry {
    active: HashSet<u64>,
    waiters: Vec<oneshot::Sender<()>>,
}

struct ServerShared {
    crc_mode: CrcMode,
    handlers: Mutex<HashMap<String, Arc<dyn RpcHandler>>>,
    collector: Option<Arc<dyn Collector>>,
    next_conn_id: AtomicU64,
    registry: Mutex<Registry>,
    closed: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl ServerShared {
    fn registry_lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers_lock(&self) -> MutexGuard<'_, HashMap<String, Arc<dyn RpcHandler>>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop a connection from the active set, resolving `conns_destroyed`
    /// waiters if this was the last one.
    fn remove_conn(&self, conn_id: u64) {
        let waiters = {
            let mut reg = self.registry_lock();
            reg.active.remove(&conn_id);
            if reg.active.is_empty() {
                std::mem::take(&mut reg.waiters)
            } else {
                Vec::new()
            }
        };
        debug!("connection {conn_id}: destroyed");
        for waiter in waiters {
            let _ = waiter.send(());
        }
    }
}

/// A Fast RPC server. Cheap to clone; clones share the handler registry
/// and connection set.
#[derive(Clone)]
pub struct FastServer {
    shared: Arc<ServerShared>,
}

impl FastServer {
    pub fn new(options: ServerOptions) -> FastServer {
        let (shutdown_tx, _) = broadcast::channel(1);
        FastServer {
            shared: Arc::new(ServerShared {
                crc_mode: options.crc_mode,
                handlers: Mutex::new(HashMap::new()),
                collector: options.collector,
                next_conn_id: AtomicU64::new(0),
                registry: Mutex::new(Registry {
                    active: HashSet::new(),
                    waiters: Vec::new(),
                }),
                closed: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    /// Register (or replace) the handler for an RPC method name. Intended
    /// to be called before `serve`; the registry is effectively read-only
    /// once connections arrive.
    pub fn register_rpc_method(&self, rpcmethod: impl Into<String>, handler: impl RpcHandler) {
        let name = rpcmethod.into();
        if self
            .shared
            .handlers_lock()
            .insert(name.clone(), Arc::new(handler))
            .is_some()
        {
            debug!("handler for RPC method \"{name}\" replaced");
        }
    }

    /// Accept connections until `close` is called. Accept errors are
    /// logged and do not stop the loop.
    pub async fn serve<L: Listener>(&self, mut listener: L) {
        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        loop {
            if self.shared.closed.load(Ordering::SeqCst) {
                return;
            }
            tokio::select! {
                res = listener.accept() => match res {
                    Ok(stream) => self.start_connection(stream),
                    Err(e) => warn!("error accepting connection: {e}"),
                },
                _ = shutdown_rx.recv() => return,
            }
        }
    }

    /// Stop accepting new connections. Existing connections and their
    /// in-flight requests are left to finish on their own.
    pub fn close(&self) {
        debug!("server closed; no longer accepting connections");
        self.shared.closed.store(true, Ordering::SeqCst);
        let _ = self.shared.shutdown_tx.send(());
    }

    /// Resolves the next time the set of active connections is empty, or
    /// on a later turn if it already is. Each call resolves exactly once.
    pub async fn conns_destroyed(&self) {
        let rx = {
            let mut reg = self.shared.registry_lock();
            if reg.active.is_empty() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                reg.waiters.push(tx);
                Some(rx)
            }
        };
        match rx {
            Some(rx) => {
                let _ = rx.await;
            }
            None => tokio::task::yield_now().await,
        }
    }

    fn start_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn_id = self.shared.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.registry_lock().active.insert(conn_id);
        debug!("connection {conn_id}: accepted");
        let shared = self.shared.clone();
        tokio::spawn(run_connection(shared, conn_id, stream));
    }
}

struct RequestInfo {
    method: String,
    started: std::time::Instant,
}

struct ConnState {
    /// In-flight requests by msgid.
    requests: HashMap<u32, RequestInfo>,
    /// Msgids the server itself terminated (no request object was ever
    /// created, e.g. unregistered-method replies). A terminal message has
    /// been sent for these, so the client may never speak them again.
    terminated: HashSet<u32>,
    closed: bool,
    retired: bool,
}

struct Connection {
    id: u64,
    server: Arc<ServerShared>,
    outbound: mpsc::Sender<FastMessage>,
    state: Mutex<ConnState>,
}

async fn run_connection<S>(server: Arc<ServerShared>, conn_id: u64, stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<FastMessage>(SEND_QUEUE_DEPTH);

    let crc_mode = server.crc_mode;
    tokio::spawn(async move {
        let mut sink = FramedWrite::new(write_half, MessageEncoder::new(crc_mode));
        while let Some(msg) = outbound_rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                warn!("connection {conn_id}: write failed: {e}");
                break;
            }
        }
    });

    let conn = Arc::new(Connection {
        id: conn_id,
        server: server.clone(),
        outbound: outbound_tx,
        state: Mutex::new(ConnState {
            requests: HashMap::new(),
            terminated: HashSet::new(),
            closed: false,
            retired: false,
        }),
    });

    let mut frames = FramedRead::new(read_half, MessageDecoder::new(server.crc_mode));
    while let Some(item) = frames.next().await {
        match item {
            Ok(msg) => {
                if let Err(e) = conn.handle_message(msg).await {
                    warn!("connection {conn_id}: terminating: {e}");
                    break;
                }
            }
            Err(e) => {
                warn!("connection {conn_id}: terminating: {e}");
                break;
            }
        }
    }
    conn.mark_closed();
}

impl Connection {
    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Which CRC variant responses to this request are encoded with: the
    /// server's configured variant, or in dual-accept mode a mirror of
    /// what the request validated under.
    fn response_mode(&self, decoded: Option<CrcMode>) -> CrcMode {
        match self.server.crc_mode {
            CrcMode::V1 => CrcMode::V1,
            CrcMode::V2 => CrcMode::V2,
            CrcMode::V1V2 => match decoded {
                Some(CrcMode::V2) => CrcMode::V2,
                _ => CrcMode::V1,
            },
        }
    }

    /// Route one inbound message. An error return is a protocol violation
    /// by the client and terminates the connection.
    async fn handle_message(self: &Arc<Self>, msg: FastMessage) -> FastResult<()> {
        let msgid = msg.msgid;

        // Requests are single-message: anything further on an in-flight
        // msgid, or on one the server already answered with a terminal
        // message, means the client is confused, and the conversation
        // cannot be trusted from here on.
        {
            let st = self.lock();
            if st.requests.contains_key(&msgid) {
                return Err(FastError::protocol(
                    FastReason::BadData,
                    format!(
                        "client sent another {} message for in-flight msgid {msgid}",
                        msg.status
                    ),
                ));
            }
            if st.terminated.contains(&msgid) {
                return Err(FastError::protocol(
                    FastReason::BadData,
                    format!(
                        "client sent a {} message for terminated msgid {msgid}",
                        msg.status
                    ),
                ));
            }
        }
        if msg.status != MessageStatus::Data {
            return Err(FastError::protocol(
                FastReason::BadData,
                format!("first message for msgid {msgid} has status {}", msg.status),
            ));
        }
        let Some(method) = msg.data.m.name.clone() else {
            return Err(FastError::protocol(
                FastReason::BadData,
                format!("request {msgid} carries no method name"),
            ));
        };

        let response_mode = self.response_mode(msg.crc_mode);
        let handler = self.server.handlers_lock().get(&method).cloned();
        let Some(handler) = handler else {
            debug!(
                "connection {}: request {msgid} for unregistered method \"{method}\"",
                self.id
            );
            let err = HandlerError::new(
                "FastError",
                format!("unsupported RPC method: \"{method}\""),
            )
            .with_info(json!({
                "fastReason": FastReason::BadMethod.as_str(),
                "rpcMethod": method,
            }));
            let reply = FastMessage::error(msgid, FastMessageData::new(&method, err.wire_value()))
                .with_crc_mode(response_mode);
            // The ERROR is this msgid's terminal message; record that so a
            // client reusing the id is rejected.
            self.lock().terminated.insert(msgid);
            self.send(reply).await;
            return Ok(());
        };

        self.lock().requests.insert(
            msgid,
            RequestInfo {
                method: method.clone(),
                started: std::time::Instant::now(),
            },
        );
        debug!(
            "connection {}: request {msgid} invoking \"{method}\"",
            self.id
        );

        let args = match msg.data.d {
            Value::Array(items) => items,
            _ => Vec::new(),
        };
        let conn = self.clone();
        tokio::spawn(async move {
            let mut writer = ResponseWriter {
                conn: conn.clone(),
                msgid,
                method: method.clone(),
                crc_mode: response_mode,
                ended: false,
            };
            match handler.invoke(&mut writer, args).await {
                Ok(()) => {
                    if !writer.ended {
                        writer.end(None).await;
                    }
                }
                Err(e) => {
                    if writer.ended {
                        debug!(
                            "connection {}: request {msgid} handler returned an error \
                             after terminating: {e}",
                            conn.id
                        );
                    } else {
                        writer.fail(e).await;
                    }
                }
            }
            conn.request_done(msgid, &method);
        });
        Ok(())
    }

    async fn send(&self, msg: FastMessage) {
        if self.lock().closed {
            debug!(
                "connection {}: discarding {} message for msgid {} (connection closed)",
                self.id, msg.status, msg.msgid
            );
            return;
        }
        if self.outbound.send(msg).await.is_err() {
            debug!("connection {}: writer gone; message discarded", self.id);
        }
    }

    fn request_done(&self, msgid: u32, method: &str) {
        if let Some(collector) = &self.server.collector {
            collector.requests_completed(method);
        }
        let retire = {
            let mut st = self.lock();
            if let Some(info) = st.requests.remove(&msgid) {
                debug!(
                    "connection {}: request {msgid} done after {:?}",
                    self.id,
                    info.started.elapsed()
                );
            }
            if st.closed && st.requests.is_empty() && !st.retired {
                st.retired = true;
                true
            } else {
                false
            }
        };
        if retire {
            self.server.remove_conn(self.id);
        }
    }

    /// The transport is gone (or the conversation is no longer
    /// trustworthy). Discard handler output from here on; the connection
    /// leaves the active set once its last request retires.
    fn mark_closed(&self) {
        let retire = {
            let mut st = self.lock();
            st.closed = true;
            if st.requests.is_empty() && !st.retired {
                st.retired = true;
                true
            } else {
                false
            }
        };
        if retire {
            self.server.remove_conn(self.id);
        }
    }
}

/// Handle a handler uses to stream its response. Bound to one request on
/// one connection.
pub struct ResponseWriter {
    conn: Arc<Connection>,
    msgid: u32,
    method: String,
    crc_mode: CrcMode,
    ended: bool,
}

impl ResponseWriter {
    /// Send one DATA message carrying `value`. Waits while the
    /// connection's outbound queue is full; that wait is the backpressure
    /// signal, so cooperative handlers simply await each write. Writes on
    /// a dead or terminated request are discarded.
    pub async fn write(&mut self, value: Value) {
        if self.ended {
            debug!(
                "connection {}: write for terminated request {} dropped",
                self.conn.id, self.msgid
            );
            return;
        }
        let msg = FastMessage::data(self.msgid, self.payload(Value::Array(vec![value])));
        self.send(msg).await;
    }

    /// Terminate the request successfully, optionally carrying one final
    /// value.
    pub async fn end(&mut self, value: Option<Value>) {
        if self.ended {
            debug!(
                "connection {}: end for terminated request {} dropped",
                self.conn.id, self.msgid
            );
            return;
        }
        self.ended = true;
        let d = Value::Array(value.into_iter().collect());
        let msg = FastMessage::end(self.msgid, self.payload(d));
        self.send(msg).await;
    }

    /// Terminate the request with an error.
    pub async fn fail(&mut self, error: HandlerError) {
        if self.ended {
            debug!(
                "connection {}: fail for terminated request {} dropped",
                self.conn.id, self.msgid
            );
            return;
        }
        self.ended = true;
        let msg = FastMessage::error(self.msgid, self.payload(error.wire_value()));
        self.send(msg).await;
    }

    pub fn connection_id(&self) -> u64 {
        self.conn.id
    }

    pub fn request_id(&self) -> u32 {
        self.msgid
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    fn payload(&self, d: Value) -> FastMessageData {
        FastMessageData::new(&self.method, d)
    }

    async fn send(&self, msg: FastMessage) {
        self.conn.send(msg.with_crc_mode(self.crc_mode)).await;
    }
}
