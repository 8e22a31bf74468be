//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the sync engine
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`ILocalIndex`] - Durable per-path records and the sync cursor
//! - [`IRemoteService`] - Push/pull protocol with the sync server
//! - [`IFilesystemApplier`] - Materializes server events on disk
//! - [`INotificationSource`] - Server push notifications

pub mod filesystem_applier;
pub mod local_index;
pub mod notification;
pub mod remote_service;

pub use filesystem_applier::IFilesystemApplier;
pub use local_index::{DeferredEvent, EventOrigin, ILocalIndex, MergeConflict, MergeOutcome};
pub use notification::{INotificationSource, NotificationMessage};
pub use remote_service::{
    IRemoteService, MetadataQuery, PullRequest, PullResponse, PushRequest, PushResponse,
    RejectedChange, RemoteError, WireChange,
};
