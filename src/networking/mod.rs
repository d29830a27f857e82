pub mod discovery;
pub mod error;
pub mod events;
pub mod file_transfer;
pub mod interface;
pub mod progress;
pub mod server;
pub mod sinks;

// Re-export key components for easier access
pub use discovery::{DiscoveryConfig, PeerDiscovery, PeerRecord, PeerRegistry};
pub use error::{DiscoveryError, FramingError, ServerError, TransferError};
pub use events::{AppEvent, EventSink, TransferDirection, TransferProgressEvent};
pub use file_transfer::{
    initiate_send, receive_one, send_file, send_path_to, send_stream_to, FrameLimits,
    ReceivedFile, TransferHeader, TransferOptions,
};
pub use interface::{outbound_address, outbound_address_or_loopback};
pub use progress::{ProgressObserver, TransferProgress};
pub use server::{ConnectionState, TransferServer};
pub use sinks::{DirectorySinks, SinkFactory};
