use anyhow::{Context, Result};
use dotenv::dotenv;
use lanshare::config::AppConfig;
use lanshare::networking::{
    initiate_send, outbound_address_or_loopback, AppEvent, DirectorySinks, EventSink,
    PeerDiscovery, PeerRegistry, TransferServer,
};
use log::{error, info};
use std::io::BufRead;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

const EVENT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

fn print_separator() {
    println!("\n{}\n", "-".repeat(60));
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let mut config = AppConfig::from_env().context("Invalid configuration")?;
    if let Some(port) = std::env::args().nth(1) {
        config.tcp_port = port
            .parse()
            .with_context(|| format!("Invalid port {:?}", port))?;
    }

    let local_ip = outbound_address_or_loopback();
    let self_address = format!("{}:{}", local_ip, config.tcp_port);

    let (events, event_rx) = EventSink::channel();
    let printer = tokio::spawn(print_events(event_rx));

    let sinks = Arc::new(DirectorySinks::new(config.receive_dir.clone()));
    let server = match TransferServer::bind(
        SocketAddr::from(([0, 0, 0, 0], config.tcp_port)),
        sinks,
        config.transfer.clone(),
        events.clone(),
    )
    .await
    {
        Ok(server) => Arc::new(server.with_shutdown_grace(config.shutdown_grace)),
        Err(e) => {
            error!("Failed to start transfer server: {}", e);
            return Err(e.into());
        }
    };

    info!("Node address: {}", self_address);
    info!("Receiving files into {}", config.receive_dir.display());

    let shutdown = CancellationToken::new();
    let ctrlc_token = shutdown.clone();
    ctrlc::set_handler(move || {
        ctrlc_token.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;

    let server_task = {
        let server = server.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { server.serve(token).await })
    };

    let discovery = Arc::new(PeerDiscovery::new(
        config.discovery.clone(),
        self_address,
        events.clone(),
    ));
    let discovery_tasks = discovery.start(&shutdown);

    print_help();
    run_commands(&config, &discovery.registry(), &events, &shutdown).await;

    info!("Shutting down...");
    shutdown.cancel();

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Transfer server stopped with error: {}", e),
        Err(e) => error!("Transfer server task failed: {}", e),
    }
    for task in discovery_tasks {
        if let Err(e) = task.await {
            error!("Discovery task failed: {}", e);
        }
    }

    // Senders still held by in-flight outgoing transfers keep the channel
    // open, so don't wait on the printer indefinitely.
    drop(events);
    drop(discovery);
    drop(server);
    let _ = tokio::time::timeout(EVENT_DRAIN_TIMEOUT, printer).await;

    Ok(())
}

async fn print_events(mut rx: UnboundedReceiver<AppEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            AppEvent::PeersChanged { mut peer_addresses } => {
                peer_addresses.sort();
                print_separator();
                if peer_addresses.is_empty() {
                    println!("No peers online");
                } else {
                    println!("Peers online:");
                    for (i, address) in peer_addresses.iter().enumerate() {
                        println!("  {}. {}", i + 1, address);
                    }
                }
                print_separator();
            }
            AppEvent::TransferProgress(progress) => {
                println!(
                    "{} {}: {:.1}% ({})",
                    progress.direction, progress.filename, progress.percent, progress.rate_text
                );
            }
            AppEvent::LogNotice { text } => println!("{}", text),
        }
    }
}

/// Read commands from stdin until `quit`, end of input or shutdown
async fn run_commands(
    config: &AppConfig,
    registry: &PeerRegistry,
    events: &EventSink,
    shutdown: &CancellationToken,
) {
    let mut lines = spawn_stdin_reader();

    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.recv() => line,
        };
        let Some(line) = line else {
            break;
        };

        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = parts.first() else {
            continue;
        };

        match command.to_lowercase().as_str() {
            "help" | "h" => print_help(),
            "peers" | "ls" => {
                let peers = sorted_peers(registry);
                if peers.is_empty() {
                    println!("No peers discovered yet");
                } else {
                    for (i, address) in peers.iter().enumerate() {
                        println!("  {}. {}", i + 1, address);
                    }
                }
            }
            "send" => {
                if parts.len() < 3 {
                    println!("Usage: send <path> <peer-number|host:port>");
                    continue;
                }

                // Last word is the target, everything between is the path
                let target = parts[parts.len() - 1];
                let path = PathBuf::from(parts[1..parts.len() - 1].join(" "));

                match resolve_target(registry, target) {
                    Some(destination) => {
                        info!("Sending {} to {}", path.display(), destination);
                        initiate_send(path, destination, config.transfer.clone(), events.clone());
                    }
                    None => println!("Unknown peer: {}", target),
                }
            }
            "quit" | "exit" | "q" => break,
            other => {
                println!("Unknown command: {}", other);
                print_help();
            }
        }
    }
}

/// Blocking stdin reads run on a plain thread so they never hold up runtime
/// shutdown.
fn spawn_stdin_reader() -> UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Failed to read command: {}", e);
                    break;
                }
            }
        }
    });
    rx
}

fn sorted_peers(registry: &PeerRegistry) -> Vec<String> {
    let mut peers = registry.addresses();
    peers.sort();
    peers
}

/// A 1-based index into the sorted peer list, or a literal `host:port`
fn resolve_target(registry: &PeerRegistry, target: &str) -> Option<String> {
    if let Ok(index) = target.parse::<usize>() {
        return index
            .checked_sub(1)
            .and_then(|i| sorted_peers(registry).into_iter().nth(i));
    }
    target.contains(':').then(|| target.to_string())
}

fn print_help() {
    println!("Available commands:");
    println!("  peers                          - List discovered peers");
    println!("  send <path> <peer|host:port>   - Send a file to a peer");
    println!("  help                           - Show this help");
    println!("  quit                           - Exit");
}
