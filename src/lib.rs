//! Local network peer discovery and direct file transfer.

pub mod config;
pub mod networking;
