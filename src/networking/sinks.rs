use async_trait::async_trait;
use log::{debug, warn};
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWrite;

use super::file_transfer::TransferHeader;

/// Destination for the payload of one received frame
pub type ByteSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens a destination for each incoming frame.
///
/// Where the bytes end up, and how the announced filename is sanitised, is
/// up to the implementation.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn open(&self, header: &TransferHeader) -> io::Result<ByteSink>;
}

/// Writes received files into a single directory
#[derive(Debug, Clone)]
pub struct DirectorySinks {
    receive_dir: PathBuf,
}

impl DirectorySinks {
    pub fn new(receive_dir: impl Into<PathBuf>) -> Self {
        let receive_dir = receive_dir.into();
        if !receive_dir.exists() {
            if let Err(e) = std::fs::create_dir_all(&receive_dir) {
                warn!(
                    "Failed to create receive directory {}: {}",
                    receive_dir.display(),
                    e
                );
            }
        }
        Self { receive_dir }
    }

    pub fn receive_dir(&self) -> &Path {
        &self.receive_dir
    }

    /// Path a received file is stored at, using only the final path component
    pub fn destination_for(&self, filename: &str) -> io::Result<PathBuf> {
        let name = safe_file_name(filename).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unusable filename {:?}", filename),
            )
        })?;
        Ok(self.receive_dir.join(name))
    }
}

#[async_trait]
impl SinkFactory for DirectorySinks {
    async fn open(&self, header: &TransferHeader) -> io::Result<ByteSink> {
        let path = self.destination_for(&header.filename)?;
        fs::create_dir_all(&self.receive_dir).await?;
        let file = File::create(&path).await?;
        debug!("Writing {} to {}", header.filename, path.display());
        Ok(Box::new(file))
    }
}

/// Last normal component of `filename`, treating both slash styles as separators
fn safe_file_name(filename: &str) -> Option<String> {
    let normalized = filename.replace('\\', "/");
    match Path::new(&normalized).components().last()? {
        Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
        _ => None,
    }
}
