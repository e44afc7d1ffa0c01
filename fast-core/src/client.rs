//! Client side of a Fast connection: issues requests over a shared duplex
//! transport and routes inbound messages back to the requests that are
//! waiting on them.
//!
//! Any number of requests may be in flight concurrently on one connection.
//! Each gets a fresh msgid from a wrapping 31-bit cursor, a bounded value
//! stream for its results, and exactly one terminal outcome. Connection
//! level faults (transport failure, protocol violation, explicit detach)
//! fan out to every request still in flight.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Instant;

use futures::{SinkExt, Stream, StreamExt};
use log::*;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::codec::{MessageDecoder, MessageEncoder};
use crate::crc::CrcMode;
use crate::error::{
    FastError, FastReason, FastRequestError, FastResult, FastServerError, HandlerError,
};
use crate::message::{FastMessage, FastMessageData, MessageStatus, FP_MSGID_MAX};
use crate::Collector;

/// Outbound messages that may queue before `rpc` callers wait on the
/// writer task.
const SEND_QUEUE_DEPTH: usize = 32;

/// Data values that may queue per request before the whole connection
/// pauses. Flow control is per connection, not per request: one slow
/// consumer stalls its peers on the same transport.
const REQUEST_QUEUE_DEPTH: usize = 128;

/// Client construction options, decoupled from any CLI framework.
#[derive(Clone)]
pub struct ClientOptions {
    /// CRC variant for this connection. Must be a concrete variant; only
    /// servers may run in dual-accept mode.
    pub crc_mode: CrcMode,

    /// How many recently-completed requests to remember for diagnosing
    /// late-arriving messages.
    pub n_recent_requests: usize,

    /// Optional metrics sink.
    pub collector: Option<Arc<dyn Collector>>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            crc_mode: CrcMode::V1,
            n_recent_requests: 128,
            collector: None,
        }
    }
}

struct Pending {
    method: String,
    data_tx: mpsc::Sender<Value>,
    done_tx: Option<oneshot::Sender<FastResult<()>>>,
    ndata: u64,
    /// The caller dropped its handle; keep routing the msgid but discard
    /// the values.
    abandoned: bool,
    started: Instant,
}

struct RecentRequest {
    msgid: u32,
    method: String,
    ndata: u64,
    failed: bool,
}

struct ClientState {
    requests: HashMap<u32, Pending>,
    cursor: u32,
    recent: VecDeque<RecentRequest>,
    conn_error: Option<Arc<FastError>>,
}

impl ClientState {
    /// Next free msgid: advance the wrapping cursor, skipping ids still in
    /// flight. Amortized O(1) while anywhere near fewer than 2^31 requests
    /// are outstanding.
    fn allocate_msgid(&mut self) -> u32 {
        loop {
            let id = self.cursor;
            self.cursor = if self.cursor == FP_MSGID_MAX {
                0
            } else {
                self.cursor + 1
            };
            if !self.requests.contains_key(&id) {
                return id;
            }
        }
    }
}

struct ClientShared {
    state: Mutex<ClientState>,
    n_recent: usize,
    collector: Option<Arc<dyn Collector>>,
}

impl ClientShared {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remember(&self, st: &mut ClientState, entry: RecentRequest) {
        if self.n_recent == 0 {
            return;
        }
        if st.recent.len() == self.n_recent {
            st.recent.pop_front();
        }
        st.recent.push_back(entry);
    }

    fn record_completion(&self, pending: &Pending, msgid: u32, failed: bool) {
        debug!(
            "rpc \"{}\" (msgid {msgid}) {} after {:?}, {} data values",
            pending.method,
            if failed { "failed" } else { "completed" },
            pending.started.elapsed(),
            pending.ndata
        );
        if let Some(collector) = &self.collector {
            collector.requests_completed(&pending.method);
        }
    }

    /// Route one inbound message. Returns false when the connection must
    /// be torn down.
    async fn dispatch(&self, msg: FastMessage) -> bool {
        let msgid = msg.msgid;
        let (data_tx, abandoned) = {
            let mut st = self.lock();
            let Some(pending) = st.requests.get_mut(&msgid) else {
                let recent = st.recent.iter().find(|r| r.msgid == msgid);
                let detail = match recent {
                    Some(r) => format!(
                        "received message for request \"{}\" (msgid {msgid}) \
                         that already completed",
                        r.method
                    ),
                    None => format!("received message for unknown msgid {msgid}"),
                };
                warn!("{detail}");
                drop(st);
                self.fail_all(FastError::protocol(FastReason::UnknownMsgid, detail));
                return false;
            };
            if let Value::Array(items) = &msg.data.d {
                pending.ndata += items.len() as u64;
            }
            (pending.data_tx.clone(), pending.abandoned)
        };

        match msg.status {
            MessageStatus::Data | MessageStatus::End => {
                let is_end = msg.status == MessageStatus::End;
                // Deliver the values outside the lock; a full per-request
                // queue pauses this whole connection until the consumer
                // drains it.
                if !abandoned {
                    if let Value::Array(items) = msg.data.d {
                        for item in items {
                            if data_tx.send(item).await.is_err() {
                                if let Some(p) = self.lock().requests.get_mut(&msgid) {
                                    p.abandoned = true;
                                }
                                break;
                            }
                        }
                    }
                }
                drop(data_tx);
                if is_end {
                    self.complete(msgid, Ok(()));
                }
                true
            }
            MessageStatus::Error => {
                drop(data_tx);
                let remote: HandlerError = match serde_json::from_value(msg.data.d) {
                    Ok(remote) => remote,
                    // The decoder guaranteed name and message; anything
                    // else malformed degrades to a generic server error.
                    Err(e) => {
                        HandlerError::new("FastServerError", format!("unparseable error: {e}"))
                    }
                };
                let cause = FastError::Server(FastServerError { cause: remote });
                self.complete(msgid, Err(Arc::new(cause)));
                true
            }
        }
    }

    fn complete(&self, msgid: u32, outcome: Result<(), Arc<FastError>>) {
        let mut st = self.lock();
        let Some(mut pending) = st.requests.remove(&msgid) else {
            return;
        };
        self.record_completion(&pending, msgid, outcome.is_err());
        self.remember(
            &mut st,
            RecentRequest {
                msgid,
                method: pending.method.clone(),
                ndata: pending.ndata,
                failed: outcome.is_err(),
            },
        );
        drop(st);
        if let Some(done_tx) = pending.done_tx.take() {
            let outcome = outcome.map_err(|cause| {
                FastError::Request(FastRequestError {
                    msgid,
                    method: pending.method.clone(),
                    cause,
                })
            });
            let _ = done_tx.send(outcome);
        }
    }

    /// Terminate every in-flight request with `cause`. The first
    /// connection-level fault wins; later calls are no-ops.
    fn fail_all(&self, cause: FastError) {
        let drained = {
            let mut st = self.lock();
            if st.conn_error.is_some() {
                return;
            }
            let cause = Arc::new(cause);
            st.conn_error = Some(cause.clone());
            let drained: Vec<(u32, Pending)> = st.requests.drain().collect();
            for (msgid, pending) in &drained {
                self.record_completion(pending, *msgid, true);
                self.remember(
                    &mut st,
                    RecentRequest {
                        msgid: *msgid,
                        method: pending.method.clone(),
                        ndata: pending.ndata,
                        failed: true,
                    },
                );
            }
            if drained.is_empty() {
                debug!("connection done ({cause}); no requests outstanding");
            } else {
                error!(
                    "connection failed ({cause}); failing {} outstanding request(s)",
                    drained.len()
                );
            }
            drained
                .into_iter()
                .map(|(msgid, pending)| (msgid, pending, cause.clone()))
                .collect::<Vec<_>>()
        };
        for (msgid, mut pending, cause) in drained {
            if let Some(done_tx) = pending.done_tx.take() {
                let _ = done_tx.send(Err(FastError::Request(FastRequestError {
                    msgid,
                    method: pending.method.clone(),
                    cause,
                })));
            }
        }
    }
}

/// A Fast client bound to one duplex transport.
pub struct FastClient {
    shared: Arc<ClientShared>,
    outbound: mpsc::Sender<FastMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl FastClient {
    /// Take ownership of a connected transport and start the connection's
    /// reader and writer tasks.
    pub fn new<T>(transport: T, options: ClientOptions) -> FastResult<FastClient>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let crc_mode = options.crc_mode.require_concrete("client CRC mode")?;

        let shared = Arc::new(ClientShared {
            state: Mutex::new(ClientState {
                requests: HashMap::new(),
                cursor: 0,
                recent: VecDeque::new(),
                conn_error: None,
            }),
            n_recent: options.n_recent_requests,
            collector: options.collector,
        });

        let (read_half, write_half) = tokio::io::split(transport);
        let (outbound, mut outbound_rx) = mpsc::channel::<FastMessage>(SEND_QUEUE_DEPTH);

        let writer = tokio::spawn({
            let shared = shared.clone();
            let mut sink = FramedWrite::new(write_half, MessageEncoder::new(crc_mode));
            async move {
                while let Some(msg) = outbound_rx.recv().await {
                    if let Err(e) = sink.send(msg).await {
                        shared.fail_all(e);
                        break;
                    }
                }
            }
        });

        let reader = tokio::spawn({
            let shared = shared.clone();
            let mut frames = FramedRead::new(read_half, MessageDecoder::new(crc_mode));
            async move {
                while let Some(item) = frames.next().await {
                    match item {
                        Ok(msg) => {
                            if !shared.dispatch(msg).await {
                                return;
                            }
                        }
                        Err(e) => {
                            shared.fail_all(e);
                            return;
                        }
                    }
                }
                // Orderly end of stream from the peer.
                shared.fail_all(FastError::ConnectionClosed);
            }
        });

        Ok(FastClient {
            shared,
            outbound,
            reader,
            writer,
        })
    }

    /// Issue an RPC. The returned handle yields the streamed result values
    /// in arrival order, then reports the request's terminal outcome.
    pub async fn rpc(&self, method: &str, args: Vec<Value>) -> FastResult<RequestHandle> {
        let (data_tx, data_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (done_tx, done_rx) = oneshot::channel();

        let msgid = {
            let mut st = self.shared.lock();
            let msgid = st.allocate_msgid();
            if let Some(cause) = &st.conn_error {
                return Err(FastError::Request(FastRequestError {
                    msgid,
                    method: method.into(),
                    cause: cause.clone(),
                }));
            }
            st.requests.insert(
                msgid,
                Pending {
                    method: method.into(),
                    data_tx,
                    done_tx: Some(done_tx),
                    ndata: 0,
                    abandoned: false,
                    started: Instant::now(),
                },
            );
            msgid
        };

        debug!("issuing rpc \"{method}\", msgid {msgid}");
        let msg = FastMessage::data(msgid, FastMessageData::new(method, Value::Array(args)));
        if self.outbound.send(msg).await.is_err() {
            let mut st = self.shared.lock();
            st.requests.remove(&msgid);
            let cause = st
                .conn_error
                .clone()
                .unwrap_or_else(|| Arc::new(FastError::ConnectionClosed));
            return Err(FastError::Request(FastRequestError {
                msgid,
                method: method.into(),
                cause,
            }));
        }

        Ok(RequestHandle {
            msgid,
            method: method.into(),
            data: ReceiverStream::new(data_rx),
            done_rx: Some(done_rx),
        })
    }

    /// Issue an RPC and buffer the entire result, failing if the server
    /// returns more than `max_objects` values.
    pub async fn rpc_buffer(
        &self,
        method: &str,
        args: Vec<Value>,
        max_objects: usize,
    ) -> FastResult<Vec<Value>> {
        let mut handle = self.rpc(method, args).await?;
        let mut values = Vec::new();
        while let Some(item) = handle.next().await {
            let value = item?;
            if values.len() == max_objects {
                return Err(FastError::BufferOverflow { max_objects });
            }
            values.push(value);
        }
        Ok(values)
    }

    /// Sever this client from its transport. Every in-flight request fails
    /// with a detach-caused request error; the transport itself is merely
    /// released, not shut down by the client.
    pub fn detach(&self) {
        self.reader.abort();
        self.writer.abort();
        self.shared.fail_all(FastError::Detached);
    }
}

impl Drop for FastClient {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// The per-request result stream: each element of every inbound message's
/// `d` array in arrival order, then end-of-stream on END or exactly one
/// error on failure.
#[derive(Debug)]
pub struct RequestHandle {
    msgid: u32,
    method: String,
    data: ReceiverStream<Value>,
    done_rx: Option<oneshot::Receiver<FastResult<()>>>,
}

impl RequestHandle {
    pub fn msgid(&self) -> u32 {
        self.msgid
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// The next streamed value, `None` once the request ended cleanly, or
    /// at most one error. Equivalent to polling the `Stream` impl.
    pub async fn next_value(&mut self) -> Option<FastResult<Value>> {
        self.next().await
    }

    /// Drain the stream into a vector, or return the request's failure.
    pub async fn collect_values(mut self) -> FastResult<Vec<Value>> {
        let mut values = Vec::new();
        while let Some(item) = self.next().await {
            values.push(item?);
        }
        Ok(values)
    }
}

impl Stream for RequestHandle {
    type Item = FastResult<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.data).poll_next(cx) {
            Poll::Ready(Some(value)) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(None) => {
                // Data fully drained; surface the terminal outcome once.
                let Some(done_rx) = this.done_rx.as_mut() else {
                    return Poll::Ready(None);
                };
                match Pin::new(done_rx).poll(cx) {
                    Poll::Ready(outcome) => {
                        this.done_rx = None;
                        match outcome {
                            Ok(Ok(())) => Poll::Ready(None),
                            Ok(Err(e)) => Poll::Ready(Some(Err(e))),
                            Err(_) => Poll::Ready(Some(Err(FastError::ConnectionClosed))),
                        }
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
