//! Key-value server node executable.

use std::fs::File;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use env_logger::{Env, Target};
use shardkv::{pf_error, KvServerNode, ServerId, ShardKvError};
use tokio::net::lookup_host;
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Coordinator host name.
    #[arg(short = 'H', long)]
    coord_host: String,

    /// Coordinator server-facing port.
    #[arg(short = 'm', long)]
    coord_port: u16,

    /// Port listening for client operations.
    #[arg(short = 'c', long)]
    client_port: u16,

    /// Port listening for peer server connections.
    #[arg(short = 's', long)]
    peer_port: u16,

    /// Port listening for the coordinator's command connection.
    #[arg(short = 'M', long)]
    ctrl_port: u16,

    /// Server ID of myself.
    #[arg(short = 'S', long)]
    id: ServerId,

    /// Total number of servers in the cluster.
    #[arg(short = 'n', long)]
    population: u8,

    /// Log output file (stderr if not given).
    #[arg(short = 'l', long)]
    log_file: Option<String>,

    /// Engine tunables as a TOML string.
    #[arg(long)]
    conf: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, returning `Ok(())` on success or
    /// `Err(ShardKvError)` on any error.
    fn sanitize(&self) -> Result<(), ShardKvError> {
        if self.coord_host.is_empty() {
            Err(ShardKvError("coordinator host is empty".into()))
        } else if self.coord_port == 0 {
            Err(ShardKvError(format!(
                "invalid coord_port {}",
                self.coord_port
            )))
        } else if self.client_port == 0
            || self.peer_port == 0
            || self.ctrl_port == 0
        {
            Err(ShardKvError("listen ports must be nonzero".into()))
        } else if self.client_port == self.peer_port
            || self.client_port == self.ctrl_port
            || self.peer_port == self.ctrl_port
        {
            Err(ShardKvError("listen ports must be distinct".into()))
        } else if self.population < 3 {
            Err(ShardKvError(format!(
                "invalid population {}",
                self.population
            )))
        } else if self.id >= self.population {
            Err(ShardKvError(format!(
                "invalid server ID {} / {}",
                self.id, self.population
            )))
        } else if self.threads < 2 {
            Err(ShardKvError(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

/// Actual main function of the server node.
fn server_main(args: CliArgs) -> Result<(), ShardKvError> {
    args.sanitize()?;

    let client_addr =
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.client_port));
    let peer_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.peer_port));
    let ctrl_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.ctrl_port));

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name(format!("tokio-worker-server{}", args.id))
        .build()?;

    // enter tokio runtime, set up the server node, and start the main event
    // loop logic
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

        let (tx_term, rx_term) = watch::channel(false);
        let mut node = KvServerNode::new_and_setup(
            args.id,
            args.population,
            client_addr,
            peer_addr,
            ctrl_addr,
            coord_addr,
            args.conf.as_deref(),
        )
        .await?;

        node.run(rx_term).await?;
        drop(tx_term);

        Ok::<(), ShardKvError>(()) // give type hint for this async closure
    })
}

fn main() -> ExitCode {
    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // missing or invalid flags exit 1 with the usage text
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut builder =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"));
    builder
        .format_timestamp_millis()
        .format_module_path(false)
        .format_target(false);
    if let Some(ref path) = args.log_file {
        match File::create(path) {
            Ok(file) => {
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => {
                eprintln!("cannot open log file '{}': {}", path, e);
                return ExitCode::FAILURE;
            }
        }
    }
    builder.init();

    if let Err(ref e) = server_main(args) {
        pf_error!("s"; "server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
