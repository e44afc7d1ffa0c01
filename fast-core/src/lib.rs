//! Core of the Fast streaming RPC protocol: the framing codec, the dual
//! CRC16 engine, and the per-connection multiplexers that let many
//! concurrent requests share one duplex byte transport.
//!
//! A request is a single client DATA message; the server answers with zero
//! or more DATA messages and exactly one END or ERROR. The client routes
//! inbound messages to pending requests by msgid; the server dispatches
//! requests to registered handlers by method name and hands each handler a
//! [`server::ResponseWriter`] bound to its connection and msgid.
//!
//! This crate owns the protocol and its state machines only. Transports
//! (TCP or Unix streams), logging backends, and metrics sinks are supplied
//! by the embedding application through the contracts here.

pub mod client;
pub mod codec;
pub mod crc;
pub mod error;
pub mod message;
pub mod server;

pub use client::{ClientOptions, FastClient, RequestHandle};
pub use crc::CrcMode;
pub use error::{FastError, FastReason, FastResult, HandlerError};
pub use message::{FastMessage, FastMessageData, FastMessageMetadata, MessageStatus};
pub use server::{FastServer, Listener, ResponseWriter, RpcHandler, ServerOptions};

/// Metrics sink contract. The core reports events; the application decides
/// how to aggregate and export them.
pub trait Collector: Send + Sync {
    /// One request reached its terminal outcome for the named RPC method.
    fn requests_completed(&self, rpc_method: &str);
}
