//! Cluster coordinator executable.

use std::fs::File;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use env_logger::{Env, Target};
use shardkv::{pf_error, ClusterConfig, Coordinator, ShardKvError};
use tokio::io::AsyncReadExt;
use tokio::runtime::Builder;
use tokio::sync::watch;
use tokio::time::Duration;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Client-facing locate port.
    #[arg(short = 'c', long)]
    cli_port: u16,

    /// Server-facing control port.
    #[arg(short = 's', long)]
    srv_port: u16,

    /// Path of the cluster configuration file.
    #[arg(short = 'C', long)]
    config: String,

    /// Failure detector timeout in seconds.
    #[arg(short = 't', long, default_value_t = 2)]
    timeout: u64,

    /// Log output file (stderr if not given).
    #[arg(short = 'l', long)]
    log_file: Option<String>,

    /// Engine tunables as a TOML string.
    #[arg(long)]
    conf: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, returning `Ok(())` on success or
    /// `Err(ShardKvError)` on any error.
    fn sanitize(&self) -> Result<(), ShardKvError> {
        if self.cli_port == 0 {
            Err(ShardKvError(format!("invalid cli_port {}", self.cli_port)))
        } else if self.srv_port == 0 {
            Err(ShardKvError(format!("invalid srv_port {}", self.srv_port)))
        } else if self.cli_port == self.srv_port {
            Err(ShardKvError(format!(
                "cli_port == srv_port {}",
                self.cli_port
            )))
        } else if self.timeout == 0 {
            Err(ShardKvError(format!("invalid timeout {}", self.timeout)))
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

/// Actual main function of the cluster coordinator.
fn coord_main(args: CliArgs) -> Result<(), ShardKvError> {
    args.sanitize()?;

    let cluster = ClusterConfig::from_file(Path::new(&args.config))?;

    let srv_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.srv_port));
    let cli_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.cli_port));

    // set up the termination signals handler before entering the runtime
    let (tx_term, rx_term) = watch::channel(false);
    let tx_term = Arc::new(tx_term);
    let tx_term_int = tx_term.clone();
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term_int.send(true) {
            pf_error!("m"; "error sending to term channel: {}", e);
        }
    })?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-coord")
        .build()?;

    // enter tokio runtime, set up the coordinator (which spawns and
    // initializes the whole cluster), and start the main event loop logic
    runtime.block_on(async move {
        let mut coordinator = Coordinator::new_and_setup(
            srv_addr,
            cli_addr,
            cluster,
            Duration::from_secs(args.timeout),
            args.conf.as_deref(),
        )
        .await?;

        // EOF on standard input also requests graceful shutdown
        let tx_term_eof = tx_term.clone();
        tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => {
                        let _ = tx_term_eof.send(true);
                        break;
                    }
                    Ok(_) => {} // discard input until EOF
                }
            }
        });

        coordinator.run(rx_term).await?;

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

    if let Err(ref e) = coord_main(args) {
        pf_error!("m"; "coord_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn valid_args() -> CliArgs {
        CliArgs {
            cli_port: 52601,
            srv_port: 52600,
            config: "cluster.cfg".into(),
            timeout: 2,
            log_file: None,
            conf: None,
            threads: 4,
        }
    }

    #[test]
    fn sanitize_valid() {
        assert_eq!(valid_args().sanitize(), Ok(()));
    }

    #[test]
    fn sanitize_zero_cli_port() {
        let mut args = valid_args();
        args.cli_port = 0;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_same_ports() {
        let mut args = valid_args();
        args.srv_port = args.cli_port;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_zero_timeout() {
        let mut args = valid_args();
        args.timeout = 0;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let mut args = valid_args();
        args.threads = 1;
        assert!(args.sanitize().is_err());
    }
}
