use clap::Parser;
use log::{info, warn};
use server::playset::{DotsPlayset, PlaysetRegistry};
use server::server::{Server, ShutdownKind};
use server::snapshot::{self, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[clap(short, long, default_value = "8080")]
    port: u16,

    /// Path to the persistent server state file
    #[clap(short, long, default_value = "server-data.json")]
    data: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    let args = Args::parse();

    let mut registry = PlaysetRegistry::new();
    registry.register(Arc::new(DotsPlayset));

    let server = match snapshot::load(&args.data)? {
        Some(loaded) => Server::from_snapshot(loaded, registry, args.data.clone())?,
        None => {
            warn!(
                "no data file at {}, starting with an empty server",
                args.data.display()
            );
            Server::new(ServerConfig::default(), registry, args.data.clone())
        }
    };

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("relay server listening on {}", addr);

    match server.run(listener).await {
        ShutdownKind::Clean => info!("clean shutdown complete"),
        ShutdownKind::Dirty => {
            warn!("dirty shutdown complete");
            std::process::exit(2);
        }
    }
    Ok(())
}
