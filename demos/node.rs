use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::Parser;
use overlay_dht::{Dht, NodeId, PeerDescriptor};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(author, version, about = "Run an overlay DHT node", long_about = None)]
struct Cli {
    /// Host advertised to other peers.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// UDP port to listen on.
    #[arg(short, long, default_value_t = 7070)]
    port: u16,

    /// Run as the well known entry point of `host:port`.
    #[arg(long)]
    entry_point: bool,

    /// Entry points to bootstrap from, as `host:port`.
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Store `data` under this hex key once bootstrapped.
    #[arg(long, requires = "data")]
    key: Option<String>,

    #[arg(long)]
    data: Option<String>,

    /// Log level: trace, debug, info, warn or error.
    #[arg(long, default_value = "info")]
    log: Level,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.log)
        .with_thread_names(true)
        .init();

    let entry_points = cli
        .bootstrap
        .iter()
        .filter_map(|address| {
            let (host, port) = address.rsplit_once(':')?;
            Some(PeerDescriptor::entry_point(host, port.parse().ok()?, false))
        })
        .collect::<Vec<_>>();

    let mut builder = Dht::builder()
        .host(&cli.host)
        .port(cli.port)
        .entry_points(&entry_points);

    if cli.entry_point {
        builder = builder.peer_descriptor(PeerDescriptor::entry_point(&cli.host, cli.port, false));
    }

    let mut dht = builder.build().expect("Failed to create overlay node");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))
        .expect("Error setting Ctrl-C handler");

    info!("Waiting for bootstrap...");
    match dht.bootstrapped() {
        Ok(true) => info!("Bootstrap complete!"),
        Ok(false) => warn!("Bootstrap found no peers, running alone"),
        Err(_) => return,
    }

    if let (Some(key), Some(data)) = (cli.key, cli.data) {
        match key.parse::<NodeId>() {
            Ok(key) => match dht.store_data(key, data.into_bytes(), None) {
                Ok(stored_on) => info!(?key, copies = stored_on.len(), "Stored"),
                Err(error) => warn!(?key, ?error, "Store failed"),
            },
            Err(error) => warn!(?error, "Invalid key"),
        }
    }

    let messages = dht.messages();

    while running.load(Ordering::SeqCst) {
        if let Ok(message) = messages.recv_timeout(Duration::from_millis(100)) {
            info!(from = ?message.source.node_id(), service = %message.service_id, "Received message");
        }

        if let Ok(info) = dht.info() {
            tracing::debug!(
                id = ?info.id(),
                contacts = info.routing_table_size(),
                connections = info.connections(),
                stored = info.stored_entries(),
                routed = info.messages_routed(),
                "Node status"
            );
        }
    }

    info!("Shutting down");
    dht.shutdown();
}
