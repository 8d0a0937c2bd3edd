//! remitd: the worker deployed to the destination host.
//!
//! Listens on the forwarded loopback port, serves exactly one client
//! session, and exits. Everything it prints goes to stderr, which the
//! client drains and surfaces on failure.

use std::net::TcpListener;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use remit::error::{Result, SyncError};
use remit::protocol::{LISTEN_MARKER, PROTO_MAJOR, PROTO_MINOR, VERSION_MARKER};
use remit::server;

#[derive(Parser)]
#[command(name = "remitd", version, about = "remit sync worker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept one sync session, then exit
    Serve {
        /// Address to bind; the tunnel terminates here
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        #[arg(long)]
        port: u16,

        /// Destination directory to mirror into
        #[arg(long)]
        root: PathBuf,
    },
    /// Print the protocol version and exit
    Version,
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Commands::Version => {
            eprintln!("{VERSION_MARKER} {PROTO_MAJOR}.{PROTO_MINOR}");
        }
        Commands::Serve { bind, port, root } => {
            eprintln!("{VERSION_MARKER} {PROTO_MAJOR}.{PROTO_MINOR}");
            if let Err(e) = serve(&bind, port, &root) {
                eprintln!("remitd: {e}");
                std::process::exit(e.exit_code());
            }
        }
    }
}

fn serve(bind: &str, port: u16, root: &PathBuf) -> Result<()> {
    let listener = TcpListener::bind((bind, port))
        .map_err(|e| SyncError::TransportLost(format!("bind {bind}:{port}: {e}")))?;
    eprintln!("{LISTEN_MARKER} on {}", listener.local_addr().map_err(SyncError::LocalIo)?);

    let (stream, peer) = listener
        .accept()
        .map_err(|e| SyncError::TransportLost(format!("accept: {e}")))?;
    eprintln!("remitd: client {peer}");
    drop(listener);

    server::run_connection(stream, root)
}
