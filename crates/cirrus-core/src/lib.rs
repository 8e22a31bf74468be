//! Cirrus Core - Domain logic and port definitions
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `FileChange`, `IndexRecord`, `SyncCursor`, `ServerEvent`
//! - **Failure bookkeeping** - `FailureSet` with per-change retry scheduling
//! - **Port definitions** - Traits for adapters: `ILocalIndex`, `IRemoteService`,
//!   `IFilesystemApplier`, `INotificationSource`
//! - **Configuration** - YAML-backed `Config` with validation and a builder
//!
//! # Architecture
//!
//! The domain module contains pure data and invariants with no I/O.
//! Ports define trait interfaces that adapter crates implement
//! (`cirrus-index` for the local index, `cirrus-remote` for the service).
//! The synchronization engine in `cirrus-sync` drives everything through
//! these ports.

pub mod config;
pub mod domain;
pub mod ports;
