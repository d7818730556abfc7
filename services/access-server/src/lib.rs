//! WireGuard access server library.
//!
//! This crate primarily ships an `access-server` binary, but exposes the
//! device engine and its backends as a library for integration testing and
//! reuse by an API layer.
//!
//! ## Architecture
//!
//! - **Registry**: persisted device records, the source of truth
//! - **Peer table**: the tunnel endpoint's live peers, reconciled from the registry
//! - **Engine**: device lifecycle, address allocation and reconciliation
//! - **Sync**: registry event dispatch plus the metadata and inactivity loops

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod inactive;
pub mod metadata;
pub mod peers;
pub mod registry;
pub mod sync;

pub use device::{Device, Identity, Peer, User};
pub use engine::{DeviceEngine, ReconcileStats};
pub use error::{EngineError, ErrorKind};
pub use sync::{SyncHandle, SyncOptions};
