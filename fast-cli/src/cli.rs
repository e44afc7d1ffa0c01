use clap::{Args, Parser, Subcommand};

use fast_core::CrcMode;

/// Command-line client and demo server for the Fast streaming RPC
/// protocol.
///
/// 'call' connects to a Fast server, invokes one RPC method, and prints
/// each streamed result value as a line of JSON. 'serve' runs a demo
/// server exposing the standard demo methods (echo, date, yes, fail),
/// which is handy for poking at the protocol and for smoke-testing
/// clients.
#[derive(Parser)]
#[command(name = "fast", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Invoke an RPC method and print each streamed value as a JSON line
    Call(CallArgs),

    /// Run a demo server with the standard demo RPC methods
    Serve(ServeArgs),
}

#[derive(Args)]
pub struct CallArgs {
    /// Server address, in host:port form
    #[arg(short, long)]
    pub address: String,

    /// RPC method name to invoke
    #[arg(short, long)]
    pub method: String,

    /// RPC arguments, as a JSON array
    #[arg(short = 'd', long = "args", default_value = "[]")]
    pub args: String,

    /// CRC variant to speak (v1 or v2)
    #[arg(long, default_value = "v1")]
    pub crc_mode: CrcMode,

    /// Buffer the response and fail if it exceeds this many values
    #[arg(long)]
    pub max_objects: Option<usize>,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on, in host:port form
    #[arg(short, long, default_value = "127.0.0.1:2030")]
    pub address: String,

    /// CRC variant(s) to accept (v1, v2, or the dual-accept v1v2)
    #[arg(long, default_value = "v1v2")]
    pub crc_mode: CrcMode,
}
