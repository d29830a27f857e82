use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::error::{ServerError, TransferError};
use super::events::EventSink;
use super::file_transfer::{receive_one, TransferOptions};
use super::sinks::SinkFactory;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Lifecycle of one inbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Active,
    Closed,
}

/// Accepts inbound transfer connections and runs one handler per connection
pub struct TransferServer {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    sinks: Arc<dyn SinkFactory>,
    options: TransferOptions,
    shutdown_grace: Option<Duration>,
    active: Arc<AtomicUsize>,
    events: EventSink,
}

impl TransferServer {
    /// Bind the listener. Failure here is fatal for the service.
    pub async fn bind(
        addr: SocketAddr,
        sinks: Arc<dyn SinkFactory>,
        options: TransferOptions,
        events: EventSink,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            sinks,
            options,
            shutdown_grace: None,
            active: Arc::new(AtomicUsize::new(0)),
            events,
        })
    }

    /// Abort handlers still running this long after shutdown
    pub fn with_shutdown_grace(mut self, grace: Option<Duration>) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connections currently being handled
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accept connections until `shutdown` fires, then close the listener and
    /// wait for every handler to finish.
    pub async fn serve(&self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ServerError::AlreadyServing)?;

        info!("File transfer server started on {}", self.local_addr);
        let mut handlers = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, closing listener...");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        info!("Accepted connection from {}", peer);
                        let handler = ConnectionHandler::new(
                            socket,
                            peer,
                            self.sinks.clone(),
                            self.options.clone(),
                            self.events.clone(),
                            self.active.clone(),
                        );
                        self.events.notice(format!("Accepted connection from {}", peer));
                        handlers.spawn(handler.run(shutdown.clone()));
                    }
                    Err(e) => {
                        self.accept_failed(&e);
                        time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    log_handler_exit(finished);
                }
            }
        }

        drop(listener);
        debug!("Waiting for {} connection handlers", handlers.len());

        match self.shutdown_grace {
            Some(grace) => {
                let timed_out = time::timeout(grace, drain(&mut handlers)).await.is_err();
                if timed_out {
                    warn!(
                        "{} connection handlers still running after {:?}, aborting",
                        handlers.len(),
                        grace
                    );
                    handlers.shutdown().await;
                }
            }
            None => drain(&mut handlers).await,
        }

        info!("All connections closed. Server gracefully shut down.");
        Ok(())
    }

    /// Accept errors (fd exhaustion, aborted handshakes) are usually transient,
    /// so the loop keeps the listener and retries after a short backoff.
    fn accept_failed(&self, e: &io::Error) {
        error!("Error accepting connection: {}", e);
        self.events
            .notice(format!("Failed to accept connection, retrying: {}", e));
    }
}

async fn drain(handlers: &mut JoinSet<()>) {
    while let Some(finished) = handlers.join_next().await {
        log_handler_exit(finished);
    }
}

fn log_handler_exit(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!("Connection handler panicked: {}", e);
        }
    }
}

/// Keeps the active count and reports connections that never closed normally
struct ActiveGuard {
    peer: SocketAddr,
    active: Arc<AtomicUsize>,
    events: EventSink,
    closed: bool,
}

impl ActiveGuard {
    fn new(peer: SocketAddr, active: Arc<AtomicUsize>, events: EventSink) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            peer,
            active,
            events,
            closed: false,
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        if !self.closed {
            warn!("Connection from {} aborted", self.peer);
            self.events
                .notice(format!("Connection from {} aborted during shutdown", self.peer));
        }
    }
}

enum CloseReason {
    Shutdown,
    Failed(TransferError),
}

/// Owns one inbound stream and decodes frames from it until it ends
struct ConnectionHandler {
    reader: BufReader<TcpStream>,
    peer: SocketAddr,
    state: ConnectionState,
    sinks: Arc<dyn SinkFactory>,
    options: TransferOptions,
    events: EventSink,
    guard: ActiveGuard,
}

impl ConnectionHandler {
    fn new(
        socket: TcpStream,
        peer: SocketAddr,
        sinks: Arc<dyn SinkFactory>,
        options: TransferOptions,
        events: EventSink,
        active: Arc<AtomicUsize>,
    ) -> Self {
        let guard = ActiveGuard::new(peer, active, events.clone());
        Self {
            reader: BufReader::new(socket),
            peer,
            state: ConnectionState::Accepted,
            sinks,
            options,
            events,
            guard,
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        debug!("Connection {}: {:?} -> {:?}", self.peer, self.state, next);
        self.state = next;
    }

    async fn run(mut self, shutdown: CancellationToken) {
        self.transition(ConnectionState::Active);
        let mut frames: u64 = 0;

        let reason = loop {
            // Between frames shutdown wins; a frame already started runs to completion
            let idle = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                ready = self.reader.fill_buf() => Some(ready.map(|buf| buf.is_empty())),
            };
            match idle {
                None => break CloseReason::Shutdown,
                Some(Ok(true)) => break CloseReason::Failed(TransferError::PeerClosed),
                Some(Err(e)) => break CloseReason::Failed(TransferError::Transport(e)),
                Some(Ok(false)) => {}
            }

            let received =
                receive_one(&mut self.reader, self.sinks.as_ref(), &self.options, &self.events)
                    .await;
            match received {
                Ok(file) => {
                    frames += 1;
                    info!(
                        "Successfully saved file {} ({} bytes) from {}",
                        file.filename, file.bytes_written, self.peer
                    );
                    self.events.notice(format!("Saved file {}", file.filename));
                }
                Err(e) => break CloseReason::Failed(e),
            }
        };

        self.close(reason, frames).await;
    }

    async fn close(mut self, reason: CloseReason, frames: u64) {
        match &reason {
            CloseReason::Shutdown => {
                info!("Closing connection from {} for shutdown", self.peer);
                self.events
                    .notice(format!("Connection from {} closed for shutdown", self.peer));
            }
            CloseReason::Failed(e) if e.is_graceful() => {
                info!("Connection from {} closed after {} files", self.peer, frames);
                self.events.notice(format!("Connection from {} closed", self.peer));
            }
            CloseReason::Failed(e) => {
                error!("Transfer from {} failed: {}", self.peer, e);
                self.events
                    .notice(format!("Transfer from {} failed: {}", self.peer, e));
            }
        }

        if let Err(e) = self.reader.get_mut().shutdown().await {
            debug!("Error shutting down connection from {}: {}", self.peer, e);
        }
        self.transition(ConnectionState::Closed);
        self.guard.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::events::AppEvent;
    use crate::networking::file_transfer::{send_file, TransferHeader};
    use crate::networking::sinks::memory::MemorySinks;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn start(
        sinks: &MemorySinks,
        grace: Option<Duration>,
    ) -> anyhow::Result<(
        Arc<TransferServer>,
        CancellationToken,
        tokio::task::JoinHandle<Result<(), ServerError>>,
        EventSink,
        UnboundedReceiver<AppEvent>,
    )> {
        let _ = env_logger::builder().is_test(true).try_init();
        let (events, rx) = EventSink::channel();
        let server = TransferServer::bind(
            "127.0.0.1:0".parse()?,
            Arc::new(sinks.clone()),
            TransferOptions::default(),
            events.clone(),
        )
        .await?
        .with_shutdown_grace(grace);
        let server = Arc::new(server);
        let shutdown = CancellationToken::new();

        let serving = server.clone();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { serving.serve(token).await });
        Ok((server, shutdown, task, events, rx))
    }

    /// Wait until a notice containing each of `needles` has arrived, in any
    /// order, returning the matching notices in the order of `needles`
    async fn wait_for_notices(
        rx: &mut UnboundedReceiver<AppEvent>,
        needles: &[&str],
    ) -> Vec<String> {
        let mut found: Vec<Option<String>> = vec![None; needles.len()];
        let wait = async {
            while found.iter().any(Option::is_none) {
                match rx.recv().await {
                    Some(AppEvent::LogNotice { text }) => {
                        for (slot, needle) in found.iter_mut().zip(needles) {
                            if slot.is_none() && text.contains(needle) {
                                *slot = Some(text.clone());
                            }
                        }
                    }
                    Some(_) => {}
                    None => panic!("event channel closed"),
                }
            }
        };
        if time::timeout(Duration::from_secs(10), wait).await.is_err() {
            panic!("timed out waiting for notices {:?}", needles);
        }
        found.into_iter().flatten().collect()
    }

    async fn wait_for_notice(rx: &mut UnboundedReceiver<AppEvent>, needle: &str) -> String {
        wait_for_notices(rx, &[needle]).await.remove(0)
    }

    #[tokio::test]
    async fn test_receives_sequential_files_on_one_connection() -> anyhow::Result<()> {
        let sinks = MemorySinks::default();
        let (server, shutdown, task, events, mut rx) = start(&sinks, None).await?;

        let mut stream = TcpStream::connect(server.local_addr()).await?;
        let first = vec![1u8; 70_000];
        let second = b"tiny".to_vec();
        let options = TransferOptions::default();
        let first_len = first.len() as u64;
        send_file(&mut first.as_slice(), first_len, "first.bin", &mut stream, &options, &events)
            .await?;
        let second_len = second.len() as u64;
        send_file(&mut second.as_slice(), second_len, "second.txt", &mut stream, &options, &events)
            .await?;
        stream.shutdown().await?;

        let expected = ["Saved file first.bin", "Saved file second.txt", "closed"];
        wait_for_notices(&mut rx, &expected).await;
        assert_eq!(sinks.contents("first.bin"), Some(first));
        assert_eq!(sinks.contents("second.txt"), Some(second));

        shutdown.cancel();
        task.await??;
        assert_eq!(server.active_connections(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_connection_does_not_affect_another() -> anyhow::Result<()> {
        let sinks = MemorySinks::default();
        let (server, shutdown, task, events, mut rx) = start(&sinks, None).await?;

        // Connection A announces a megabyte, sends a little, then vanishes
        let mut broken = TcpStream::connect(server.local_addr()).await?;
        let header = TransferHeader {
            filename: "a.bin".to_string(),
            content_length: 1024 * 1024,
        };
        broken.write_all(&header.encode()?).await?;
        broken.write_all(&[0xaa; 1000]).await?;

        // Connection B streams a complete file concurrently
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 7) as u8).collect();
        let mut healthy = TcpStream::connect(server.local_addr()).await?;
        let payload = content.clone();
        let sender_events = events.clone();
        let sender = tokio::spawn(async move {
            let result = send_file(
                &mut payload.as_slice(),
                payload.len() as u64,
                "b.bin",
                &mut healthy,
                &TransferOptions::default(),
                &sender_events,
            )
            .await;
            let _ = healthy.shutdown().await;
            result
        });

        drop(broken);
        let notices = wait_for_notices(&mut rx, &["failed", "Saved file b.bin"]).await;
        assert!(notices[0].contains("truncated"), "unexpected notice: {}", notices[0]);

        sender.await??;
        assert_eq!(sinks.contents("b.bin"), Some(content));
        assert_eq!(sinks.contents("a.bin").map(|a| a.len()), Some(1000));

        shutdown.cancel();
        task.await??;
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_closes_idle_connections() -> anyhow::Result<()> {
        let sinks = MemorySinks::default();
        let (server, shutdown, task, _events, mut rx) = start(&sinks, None).await?;

        let _idle = TcpStream::connect(server.local_addr()).await?;
        wait_for_notice(&mut rx, "Accepted connection").await;
        assert_eq!(server.active_connections(), 1);

        shutdown.cancel();
        time::timeout(Duration::from_secs(5), task).await???;
        wait_for_notice(&mut rx, "closed for shutdown").await;
        assert_eq!(server.active_connections(), 0);

        // The listener is gone once serve returns
        assert!(TcpStream::connect(server.local_addr()).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_stalled_transfer_is_aborted_after_grace() -> anyhow::Result<()> {
        let sinks = MemorySinks::default();
        let (server, shutdown, task, _events, mut rx) =
            start(&sinks, Some(Duration::from_millis(200))).await?;

        let mut stalled = TcpStream::connect(server.local_addr()).await?;
        let header = TransferHeader {
            filename: "stalled.bin".to_string(),
            content_length: 10_000,
        };
        stalled.write_all(&header.encode()?).await?;
        stalled.write_all(&[1u8; 10]).await?;
        // Wait until the handler is mid-frame
        while sinks.contents("stalled.bin").map(|c| c.len()) != Some(10) {
            time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        time::timeout(Duration::from_secs(5), task).await???;
        wait_for_notice(&mut rx, "aborted").await;
        assert_eq!(server.active_connections(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_accept_failure_is_reported() -> anyhow::Result<()> {
        let (events, mut rx) = EventSink::channel();
        let server = TransferServer::bind(
            "127.0.0.1:0".parse()?,
            Arc::new(MemorySinks::default()),
            TransferOptions::default(),
            events,
        )
        .await?;

        server.accept_failed(&io::Error::new(io::ErrorKind::Other, "too many open files"));

        let notice = wait_for_notice(&mut rx, "Failed to accept").await;
        assert!(notice.contains("too many open files"));
        Ok(())
    }

    #[tokio::test]
    async fn test_bind_conflict_and_double_serve() -> anyhow::Result<()> {
        let sinks = MemorySinks::default();
        let (events, _rx) = EventSink::channel();
        let server = TransferServer::bind(
            "127.0.0.1:0".parse()?,
            Arc::new(sinks.clone()),
            TransferOptions::default(),
            events.clone(),
        )
        .await?;

        let conflict = TransferServer::bind(
            server.local_addr(),
            Arc::new(sinks.clone()),
            TransferOptions::default(),
            events,
        )
        .await;
        assert!(matches!(conflict, Err(ServerError::Bind { .. })));

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        server.serve(shutdown.clone()).await?;
        assert!(matches!(
            server.serve(shutdown).await,
            Err(ServerError::AlreadyServing)
        ));
        Ok(())
    }
}
