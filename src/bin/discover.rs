use anyhow::Result;
use dotenv::dotenv;
use lanshare::config::AppConfig;
use lanshare::networking::interface::multicast_interfaces;
use lanshare::networking::{outbound_address_or_loopback, AppEvent, EventSink, PeerDiscovery};
use log::info;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    println!("=== Peer Discovery Utility ===");
    println!("Run it on several machines on the same network to see them find each other.");
    println!();

    let config = AppConfig::from_env()?;

    // Port advertised to peers; nothing listens on it here
    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(config.tcp_port);

    println!("=== Network Interfaces ===");
    match multicast_interfaces() {
        Ok(interfaces) => {
            for (i, interface) in interfaces.iter().enumerate() {
                println!("{}: {} - {}", i + 1, interface.name, interface.ip);
            }
        }
        Err(e) => println!("Failed to list network interfaces: {}", e),
    }

    let local_ip = outbound_address_or_loopback();
    let self_address = format!("{}:{}", local_ip, port);
    println!("\nAnnouncing {} on {}", self_address, config.discovery.group_addr());
    println!("Press Ctrl+C to stop\n");

    let (events, mut event_rx) = EventSink::channel();
    let discovery = Arc::new(PeerDiscovery::new(config.discovery, self_address, events));

    let shutdown = CancellationToken::new();
    let ctrlc_token = shutdown.clone();
    ctrlc::set_handler(move || {
        ctrlc_token.cancel();
    })?;

    let tasks = discovery.start(&shutdown);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(event) = event_rx.recv() => match event {
                AppEvent::PeersChanged { mut peer_addresses } => {
                    peer_addresses.sort();
                    println!("Peers ({}):", peer_addresses.len());
                    for address in &peer_addresses {
                        println!("  {}", address);
                    }
                }
                AppEvent::LogNotice { text } => println!("{}", text),
                AppEvent::TransferProgress(_) => {}
            },
        }
    }

    info!("Stopping discovery");
    for task in tasks {
        task.await?;
    }
    Ok(())
}
