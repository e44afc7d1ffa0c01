//! The standard demo RPC methods served by `fast serve`.

use async_trait::async_trait;
use serde_json::{json, Value};

use fast_core::message::now_micros;
use fast_core::{FastServer, HandlerError, ResponseWriter, RpcHandler};

pub fn register_demo_handlers(server: &FastServer) {
    server.register_rpc_method("echo", EchoHandler);
    server.register_rpc_method("date", DateHandler);
    server.register_rpc_method("yes", YesHandler);
    server.register_rpc_method("fail", FailHandler);
}

/// Writes each request argument back verbatim.
struct EchoHandler;

#[async_trait]
impl RpcHandler for EchoHandler {
    async fn invoke(
        &self,
        writer: &mut ResponseWriter,
        args: Vec<Value>,
    ) -> Result<(), HandlerError> {
        for arg in args {
            writer.write(arg).await;
        }
        Ok(())
    }
}

/// Reports the server's current time in microseconds since the epoch.
struct DateHandler;

#[async_trait]
impl RpcHandler for DateHandler {
    async fn invoke(
        &self,
        writer: &mut ResponseWriter,
        _args: Vec<Value>,
    ) -> Result<(), HandlerError> {
        writer.write(json!({ "timestamp": now_micros() })).await;
        Ok(())
    }
}

/// Like yes(1): `[{"value": v, "count": n}]` streams `v` back `n` times.
struct YesHandler;

#[async_trait]
impl RpcHandler for YesHandler {
    async fn invoke(
        &self,
        writer: &mut ResponseWriter,
        args: Vec<Value>,
    ) -> Result<(), HandlerError> {
        let spec = args.first().ok_or_else(|| {
            HandlerError::new("BadArgsError", "expected one {value, count} argument")
        })?;
        let count = spec.get("count").and_then(Value::as_u64).ok_or_else(|| {
            HandlerError::new("BadArgsError", "\"count\" must be a non-negative integer")
        })?;
        let value = spec.get("value").cloned().unwrap_or(Value::Null);
        for _ in 0..count {
            writer.write(value.clone()).await;
        }
        Ok(())
    }
}

/// Always fails, with the name and message from its argument if one is
/// given. Useful for exercising client-side error plumbing.
struct FailHandler;

#[async_trait]
impl RpcHandler for FailHandler {
    async fn invoke(
        &self,
        _writer: &mut ResponseWriter,
        args: Vec<Value>,
    ) -> Result<(), HandlerError> {
        let spec = args.first();
        let name = spec
            .and_then(|s| s.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("DemoError");
        let message = spec
            .and_then(|s| s.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("the demo server failed this request on purpose");
        Err(HandlerError::new(name, message))
    }
}
