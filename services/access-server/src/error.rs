//! Engine error type.

use thiserror::Error;
use wga_networking::NetworkError;

use crate::peers::PeerError;
use crate::registry::RegistryError;

/// Coarse classification callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; retrying the same request will fail again.
    Validation,
    /// An address pool has no free address.
    Exhausted,
    /// The requested device does not exist.
    NotFound,
    /// A collaborator failed; retrying later may succeed.
    Unavailable,
}

/// Errors returned by [`crate::DeviceEngine`].
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("device name must not be empty")]
    EmptyName,

    #[error("device '{name}' already exists for this user")]
    DuplicateName { name: String },

    #[error("public key is already registered to another device")]
    DuplicateKey,

    #[error("invalid {field}: {source}")]
    InvalidKey {
        field: &'static str,
        #[source]
        source: NetworkError,
    },

    #[error(transparent)]
    Exhausted(NetworkError),

    #[error("device {owner}/{name} not found")]
    NotFound { owner: String, name: String },

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("peer table error: {0}")]
    Peer(#[from] PeerError),

    /// A stored device record is malformed.
    #[error("corrupt device record {owner}/{name}: {source}")]
    CorruptRecord {
        owner: String,
        name: String,
        #[source]
        source: NetworkError,
    },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyName
            | Self::DuplicateName { .. }
            | Self::DuplicateKey
            | Self::InvalidKey { .. } => {
                ErrorKind::Validation
            }
            Self::Exhausted(_) => ErrorKind::Exhausted,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Registry(e) if e.is_not_found() => ErrorKind::NotFound,
            Self::Registry(_) | Self::Peer(_) | Self::CorruptRecord { .. } => ErrorKind::Unavailable,
        }
    }
}
