//! Nimbus messaging fabric
//!
//! Two primitives over plain TCP: fire-and-forget push channels (ordered
//! per-sender) and synchronous request/reply. A process-wide socket cache
//! keyed by destination address retains push channels for the process
//! lifetime. Sends are best-effort; every blocking receive carries a timeout
//! surfaced as a first-class error, never a silent retry.

pub mod channels;
pub mod socket_cache;
pub mod testing;

pub use channels::{bind_pull, bind_rep, request, ReplyHandle};
pub use socket_cache::{PushSocket, Sender, SocketCache};

use std::time::Duration;
use thiserror::Error;

/// Timeout applied to KVS request/reply exchanges
pub const KVS_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout applied to pin-accept handshakes
pub const PIN_ACCEPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Poll interval driving each server's housekeeping branch
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Result type for fabric operations
pub type FabricResult<T> = Result<T, FabricError>;

/// Errors raised by the messaging fabric
#[derive(Error, Debug)]
pub enum FabricError {
    /// A receive or request did not complete within its deadline
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Binding a well-known port failed; fatal at startup
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Connecting to a peer failed
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// Framing or deserialization failure on a live channel
    #[error(transparent)]
    Proto(#[from] nimbus_proto::ProtoError),

    /// The peer closed the channel before a reply arrived
    #[error("channel to {0} closed")]
    ChannelClosed(String),
}
