// Each integration test file is compiled as its own binary crate with its
// own copy of this module, so helpers used by one binary but not another
// would trigger false "dead code" warnings. Allow dead_code to silence
// those per-binary false positives.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use fast_core::codec::{MessageDecoder, MessageEncoder};
use fast_core::{
    ClientOptions, CrcMode, FastClient, FastMessage, FastServer, HandlerError, ResponseWriter,
    RpcHandler, ServerOptions,
};

/// Await a future, panicking if it takes unreasonably long. Keeps a hung
/// connection from hanging the whole test run.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), fut)
        .await
        .expect("test future timed out")
}

// -- Demo handlers ------------------------------------------------------------

/// Writes one `{"value": <arg>}` per request argument.
pub struct EchoHandler;

#[async_trait]
impl RpcHandler for EchoHandler {
    async fn invoke(
        &self,
        writer: &mut ResponseWriter,
        args: Vec<Value>,
    ) -> Result<(), HandlerError> {
        for arg in args {
            writer.write(json!({ "value": arg })).await;
        }
        Ok(())
    }
}

/// Like yes(1): args `[{"value": v, "count": n}]` produce `v` written `n`
/// times.
pub struct YesHandler;

#[async_trait]
impl RpcHandler for YesHandler {
    async fn invoke(
        &self,
        writer: &mut ResponseWriter,
        args: Vec<Value>,
    ) -> Result<(), HandlerError> {
        let spec = args
            .first()
            .ok_or_else(|| HandlerError::new("BadArgsError", "expected one argument"))?;
        let count = spec
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| HandlerError::new("BadArgsError", "count must be an integer"))?;
        let value = spec.get("value").cloned().unwrap_or(Value::Null);
        for _ in 0..count {
            writer.write(value.clone()).await;
        }
        Ok(())
    }
}

/// Streams `{"i": k}` for `k` in `0..n` (first argument), then fails the
/// request.
pub struct FailAfterHandler;

#[async_trait]
impl RpcHandler for FailAfterHandler {
    async fn invoke(
        &self,
        writer: &mut ResponseWriter,
        args: Vec<Value>,
    ) -> Result<(), HandlerError> {
        let n = args.first().and_then(Value::as_u64).unwrap_or(0);
        for i in 0..n {
            writer.write(json!({ "i": i })).await;
        }
        Err(
            HandlerError::new("MyStupidError", "the server ate my response")
                .with_info(json!({ "attempt": 3 }))
                .with_context(json!({ "request": "doomed" })),
        )
    }
}

// -- Managed test server ------------------------------------------------------

/// A Fast server on an ephemeral loopback port with the demo handlers
/// registered. The serve task is aborted when this struct is dropped.
pub struct TestFastServer {
    pub server: FastServer,
    pub addr: SocketAddr,
    serve_task: JoinHandle<()>,
}

impl TestFastServer {
    pub async fn start(options: ServerOptions) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().expect("listener has no local addr");

        let server = FastServer::new(options);
        server.register_rpc_method("echo", EchoHandler);
        server.register_rpc_method("yes", YesHandler);
        server.register_rpc_method("fail_after", FailAfterHandler);

        let serve_task = tokio::spawn({
            let server = server.clone();
            async move { server.serve(listener).await }
        });

        TestFastServer {
            server,
            addr,
            serve_task,
        }
    }

    /// Connect a new client to this server.
    pub async fn connect(&self, crc_mode: CrcMode) -> FastClient {
        let stream = tokio::net::TcpStream::connect(self.addr)
            .await
            .expect("failed to connect to test server");
        FastClient::new(
            stream,
            ClientOptions {
                crc_mode,
                ..ClientOptions::default()
            },
        )
        .expect("failed to construct client")
    }
}

impl Drop for TestFastServer {
    fn drop(&mut self) {
        self.serve_task.abort();
    }
}

// -- Scripted fake peer -------------------------------------------------------

/// The server end of an in-memory connection, exposed frame-by-frame so
/// tests can script exact wire behavior (multi-item DATA messages,
/// unknown msgids, garbage bytes).
pub struct FakePeer {
    pub frames: FramedRead<ReadHalf<DuplexStream>, MessageDecoder>,
    pub sink: FramedWrite<WriteHalf<DuplexStream>, MessageEncoder>,
}

impl FakePeer {
    pub async fn recv(&mut self) -> FastMessage {
        use futures::StreamExt;
        within(self.frames.next())
            .await
            .expect("peer stream ended")
            .expect("peer received invalid frame")
    }

    pub async fn send(&mut self, msg: FastMessage) {
        use futures::SinkExt;
        within(self.sink.send(msg)).await.expect("peer send failed");
    }
}

/// An in-memory duplex connection: the client end plus a scripted peer
/// speaking `crc_mode` on the other end.
pub fn fake_connection(crc_mode: CrcMode) -> (DuplexStream, FakePeer) {
    let (client_end, server_end) = tokio::io::duplex(256 * 1024);
    let (read_half, write_half) = tokio::io::split(server_end);
    let peer = FakePeer {
        frames: FramedRead::new(read_half, MessageDecoder::new(crc_mode)),
        sink: FramedWrite::new(write_half, MessageEncoder::new(crc_mode)),
    };
    (client_end, peer)
}
