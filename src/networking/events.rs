use log::trace;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Direction of file transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    /// Sending a file
    Sending,
    /// Receiving a file
    Receiving,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sending => write!(f, "Sending"),
            Self::Receiving => write!(f, "Receiving"),
        }
    }
}

/// A progress update for one transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProgressEvent {
    pub transfer_id: Uuid,
    pub filename: String,
    /// 0.0 to 100.0
    pub percent: f64,
    /// Bytes per second
    pub rate: f64,
    pub rate_text: String,
    pub direction: TransferDirection,
}

/// Events delivered to the front end.
///
/// `PeersChanged` always carries the full peer list, never a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    PeersChanged { peer_addresses: Vec<String> },
    TransferProgress(TransferProgressEvent),
    LogNotice { text: String },
}

/// Sending half of the event channel, cloned into every task that reports.
///
/// The channel is unbounded so emitting never blocks a network task.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<AppEvent>,
}

impl EventSink {
    /// Create a new sink and the receiver the front end reads from
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: AppEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event receiver dropped, discarding event");
        }
    }

    pub fn peers_changed(&self, peer_addresses: Vec<String>) {
        self.emit(AppEvent::PeersChanged { peer_addresses });
    }

    pub fn notice(&self, text: impl Into<String>) {
        self.emit(AppEvent::LogNotice { text: text.into() });
    }

    pub fn progress(&self, event: TransferProgressEvent) {
        self.emit(AppEvent::TransferProgress(event));
    }
}
