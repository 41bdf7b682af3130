//! Error types for overlay network operations

use std::fmt;
use thiserror::Error;

/// Reconciliation step that failed, used to identify where an attempt stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStep {
    /// Creating the virtual interface
    CreateDevice,
    /// Reading the current tunnel configuration
    InspectDevice,
    /// Applying the tunnel peer set
    ConfigurePeers,
    /// Assigning the overlay address
    AssignAddress,
    /// Setting the interface MTU
    SetMtu,
    /// Bringing the interface up
    LinkUp,
    /// Reading or updating host routes
    Routes,
}

impl fmt::Display for ReconcileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            Self::CreateDevice => "create device",
            Self::InspectDevice => "inspect device",
            Self::ConfigurePeers => "configure peers",
            Self::AssignAddress => "assign address",
            Self::SetMtu => "set mtu",
            Self::LinkUp => "link up",
            Self::Routes => "routes",
        };
        f.write_str(step)
    }
}

/// Errors that can occur during overlay network operations
#[derive(Debug, Error)]
pub enum OverlayError {
    /// Membership transport failure (bind, send, join)
    #[error("Membership transport error: {0}")]
    Transport(String),

    /// Tunnel driver command failed
    #[error("Tunnel driver error: {0}")]
    TunnelDriver(String),

    /// Host network command failed
    #[error("Host network error: {0}")]
    HostNetwork(String),

    /// Invalid CIDR notation or unsupported overlay prefix
    #[error("Invalid CIDR notation: {0}")]
    InvalidCidr(String),

    /// Encoded peer metadata does not fit the transport budget
    #[error("Peer metadata is {size} bytes, exceeding the {limit} byte limit")]
    MetadataOversize { size: usize, limit: usize },

    /// Peer metadata could not be decoded
    #[error("Malformed peer metadata: {0}")]
    MalformedMetadata(String),

    /// Join targets were given but no member could be reached
    #[error("Could not join any of the {0} provided addresses")]
    NoReachablePeers(usize),

    /// Operation not valid in the directory's current phase
    #[error("Invalid membership directory state: {0}")]
    InvalidState(String),

    /// The snapshot stream was already handed out
    #[error("Membership event stream already taken")]
    EventsTaken,

    /// A reconciliation step failed; the remaining steps were skipped
    #[error("Reconciliation failed at step '{step}': {source}")]
    Reconcile {
        step: ReconcileStep,
        #[source]
        source: Box<OverlayError>,
    },

    /// Invalid key format
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation cancelled by shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OverlayError {
    /// Wrap an error with the reconciliation step it happened in
    pub fn at_step(self, step: ReconcileStep) -> Self {
        Self::Reconcile {
            step,
            source: Box::new(self),
        }
    }

    /// Step that failed, if this is a reconciliation error
    pub fn step(&self) -> Option<ReconcileStep> {
        match self {
            Self::Reconcile { step, .. } => Some(*step),
            _ => None,
        }
    }
}

/// Result type alias for overlay operations
pub type Result<T> = std::result::Result<T, OverlayError>;
