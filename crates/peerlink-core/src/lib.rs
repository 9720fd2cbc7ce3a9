//! peerlink-core: shared protocol library for the peerlink signaling relay.
//!
//! Provides the JSON control envelope, newline framing with a streaming
//! decoder, and the relay error taxonomy.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{decode_envelope, frame_encode, EnvelopeDecoder, DEFAULT_MAX_FRAME_SIZE};
pub use error::{ErrorKind, RelayError, RelayResult};
pub use messages::{ConnectDetails, ConnectionInfo, Envelope, MsgType};
