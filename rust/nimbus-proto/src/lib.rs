//! Nimbus control-plane wire protocol
//!
//! Message types, the tagged argument model, the fixed port plan, and the
//! length-prefixed frame codec shared by every Nimbus component. Exact field
//! names and numeric codes are frozen for interop with existing clients.

pub mod args;
pub mod codec;
pub mod dag;
pub mod messages;
pub mod ports;

pub use args::{decode_args, Argument};
pub use codec::{from_bytes, read_frame, to_bytes, write_frame};
pub use messages::*;

use thiserror::Error;

/// Result type for protocol operations
pub type ProtoResult<T> = Result<T, ProtoError>;

/// Errors raised while encoding, decoding, or framing messages
#[derive(Error, Debug)]
pub enum ProtoError {
    /// Serialization or deserialization failure
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Frame exceeds the configured maximum
    #[error("frame of {0} bytes exceeds maximum")]
    FrameTooLarge(usize),

    /// Underlying transport I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A location string was not of the form `ip:tid`
    #[error("malformed location string: {0}")]
    MalformedLocation(String),
}
