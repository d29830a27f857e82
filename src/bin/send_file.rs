use anyhow::{anyhow, Result};
use dotenv::dotenv;
use lanshare::config::AppConfig;
use lanshare::networking::{send_path_to, AppEvent, EventSink};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv().ok();

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        return Err(anyhow!("Usage: {} <path> <host:port>", args[0]));
    }
    let path = PathBuf::from(&args[1]);
    let destination = &args[2];

    let config = AppConfig::from_env()?;
    let (events, mut event_rx) = EventSink::channel();

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                AppEvent::TransferProgress(progress) => println!(
                    "{} {}: {:.1}% ({})",
                    progress.direction, progress.filename, progress.percent, progress.rate_text
                ),
                AppEvent::LogNotice { text } => println!("{}", text),
                AppEvent::PeersChanged { .. } => {}
            }
        }
    });

    let result = send_path_to(&path, destination, &config.transfer, &events).await;

    // Closing the channel lets the printer finish
    drop(events);
    printer.await?;

    let sent = result?;
    println!("Sent {} bytes", sent);
    Ok(())
}
