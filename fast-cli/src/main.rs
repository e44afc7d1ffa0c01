mod cli;
mod demo;

use std::process;

use clap::Parser;
use log::info;
use serde_json::Value;

use cli::{CallArgs, Cli, Command, ServeArgs};
use fast_core::{ClientOptions, FastClient, FastError, FastResult, FastServer, ServerOptions};

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Call(args) => run_call(args).await,
        Command::Serve(args) => run_serve(args).await,
    };

    if let Err(e) = result {
        eprintln!("fast: {e}");
        let code = match e {
            FastError::InvalidArgument(_) => 2,
            _ => 1,
        };
        process::exit(code);
    }
}

async fn run_call(args: CallArgs) -> FastResult<()> {
    let rpc_args: Value = serde_json::from_str(&args.args)
        .map_err(|e| FastError::InvalidArgument(format!("--args is not valid JSON: {e}")))?;
    let Value::Array(rpc_args) = rpc_args else {
        return Err(FastError::InvalidArgument(
            "--args must be a JSON array".into(),
        ));
    };

    let stream = tokio::net::TcpStream::connect(&args.address)
        .await
        .map_err(|e| {
            FastError::Transport(std::io::Error::new(
                e.kind(),
                format!("failed to connect to {}: {e}", args.address),
            ))
        })?;
    let client = FastClient::new(
        stream,
        ClientOptions {
            crc_mode: args.crc_mode,
            ..ClientOptions::default()
        },
    )?;

    match args.max_objects {
        Some(max_objects) => {
            let values = client
                .rpc_buffer(&args.method, rpc_args, max_objects)
                .await?;
            for value in values {
                println!("{value}");
            }
        }
        None => {
            let mut handle = client.rpc(&args.method, rpc_args).await?;
            while let Some(item) = handle.next_value().await {
                println!("{}", item?);
            }
        }
    }
    Ok(())
}

async fn run_serve(args: ServeArgs) -> FastResult<()> {
    let listener = tokio::net::TcpListener::bind(&args.address)
        .await
        .map_err(FastError::Transport)?;
    info!("listening at {} (crc mode {})", args.address, args.crc_mode);

    let server = FastServer::new(ServerOptions {
        crc_mode: args.crc_mode,
        collector: None,
    });
    demo::register_demo_handlers(&server);

    tokio::select! {
        _ = server.serve(listener) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down; waiting for connections to drain");
            server.close();
            server.conns_destroyed().await;
        }
    }
    Ok(())
}
