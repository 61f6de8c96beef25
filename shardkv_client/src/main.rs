//! Command-line client: locate a key through the coordinator, then issue a
//! single operation against the owning server.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use env_logger::Env;
use shardkv::{
    key_from_bytes, pf_error, KvClient, OpStatus, ShardKvError,
};
use tokio::net::lookup_host;
use tokio::runtime::Builder;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Coordinator host name.
    #[arg(short = 'H', long, default_value_t = String::from("localhost"))]
    coord_host: String,

    /// Coordinator client-facing port.
    #[arg(short = 'p', long, default_value_t = 52601)]
    coord_port: u16,

    /// Operation to perform.
    #[command(subcommand)]
    op: OpCommand,
}

/// Supported operations.
#[derive(Subcommand, Debug)]
enum OpCommand {
    /// Probe the server that owns a key.
    Noop { key: String },

    /// Read the value stored for a key.
    Get { key: String },

    /// Insert or replace the value stored for a key.
    Put { key: String, value: String },
}

/// Actual main function of the client.
fn client_main(args: CliArgs) -> Result<bool, ShardKvError> {
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("tokio-worker-client")
        .build()?;

    runtime.block_on(async move {
        let coord_addr =
            lookup_host((args.coord_host.as_str(), args.coord_port))
                .await?
                .next()
                .ok_or_else(|| {
                    ShardKvError(format!(
                        "cannot resolve coordinator host '{}'",
                        args.coord_host
                    ))
                })?;
        let client = KvClient::new(coord_addr);

        let reply = match &args.op {
            OpCommand::Noop { key } => {
                client.noop(&key_from_bytes(key.as_bytes())).await?
            }
            OpCommand::Get { key } => {
                client.get(&key_from_bytes(key.as_bytes())).await?
            }
            OpCommand::Put { key, value } => {
                client
                    .put(
                        &key_from_bytes(key.as_bytes()),
                        value.as_bytes().to_vec(),
                    )
                    .await?
            }
        };

        match reply.status {
            OpStatus::Success => {
                match reply.value {
                    Some(value) => {
                        println!("{}", String::from_utf8_lossy(&value))
                    }
                    None => println!("OK"),
                }
                Ok(true)
            }
            OpStatus::KeyNotFound => {
                eprintln!("key not found");
                Ok(false)
            }
            OpStatus::OutOfSpace => {
                eprintln!("server out of space");
                Ok(false)
            }
            OpStatus::ServerFailure => {
                eprintln!("server failure");
                Ok(false)
            }
        }
    })
}

fn main() -> ExitCode {
    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    env_logger::Builder::from_env(Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    match client_main(args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(ref e) => {
            pf_error!("c"; "client_main exited: {}", e);
            ExitCode::FAILURE
        }
    }
}
