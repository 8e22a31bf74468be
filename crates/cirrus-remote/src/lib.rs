//! Cirrus Remote - HTTP adapter for the sync service
//!
//! Implements the remote ports of `cirrus-core` over JSON/HTTP:
//! - Sync_To / Sync_From exchanges and metadata queries
//! - Content downloads by storage key
//! - Long-polled server notifications
//!
//! ## Modules
//!
//! - [`client`] - [`RemoteClient`](client::RemoteClient), the
//!   [`IRemoteService`](cirrus_core::ports::IRemoteService) adapter
//! - [`notifications`] - long-poll notification source

pub mod client;
pub mod notifications;

pub use client::RemoteClient;
pub use notifications::NotificationPoller;
