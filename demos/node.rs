use std::net::SocketAddr;

use kadmos::{Config, Dht, DhtValue, Kuid, ValueType, Version};

use clap::Parser;

use tracing::{info, warn, Level};
use tracing_subscriber;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Port to listen on, random if omitted
    #[arg(short, long)]
    port: Option<u16>,
    /// Address of a known node to ping and ask for contacts
    #[arg(short, long)]
    bootstrap: Option<SocketAddr>,
    /// Text value to store under the sha1 of itself
    #[arg(short, long)]
    store: Option<String>,
    /// Accept contacts with private addresses
    #[arg(long)]
    private: bool,
    /// Log at debug level
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_thread_names(true)
        .init();

    let mut dht = Dht::new(Config {
        port: cli.port,
        allow_private_addresses: cli.private,
        ..Default::default()
    })
    .expect("Failed to start the node");

    info!(local_id = ?dht.local_id(), local_addr = ?dht.local_addr(), "Node is running! Press Ctrl+C to stop.");

    if let Some(address) = cli.bootstrap {
        match dht.ping(address) {
            Ok(response) => {
                info!(?address, node_id = ?response.message.node_id, "Bootstrap node responded");

                match dht.find_node(address, *dht.local_id()) {
                    Ok(contacts) => {
                        info!(count = contacts.len(), "Received contacts");
                        for contact in contacts {
                            dht.add_contact(contact);
                        }
                    }
                    Err(error) => warn!(?error, "FIND_NODE failed"),
                }
            }
            Err(error) => warn!(?address, ?error, "Bootstrap node did not respond"),
        }
    }

    if let Some(text) = cli.store {
        let key = Kuid::sha1(text.as_bytes());
        let stored = dht.store_local(key, DhtValue::new(ValueType::TEXT, Version::ZERO, text));

        info!(?key, stored, "Stored local value");
    }

    let (sender, receiver) = flume::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = sender.send(());
    })
    .expect("Failed to set the Ctrl+C handler");

    let _ = receiver.recv();

    info!("Shutting down");
    dht.shutdown();
}
