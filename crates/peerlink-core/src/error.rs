use thiserror::Error;

/// Errors produced by the peerlink relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("no active control connection")]
    NoActiveConnection,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid connect payload: {0}")]
    PayloadParse(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("peer connection creation failed: {0}")]
    EngineInit(String),

    #[error("offer creation failed: {0}")]
    OfferCreation(String),

    #[error("set local description failed: {0}")]
    LocalDescription(String),

    #[error("set remote description failed: {0}")]
    RemoteDescription(String),

    #[error("add candidate failed: {0}")]
    Candidate(String),

    #[error("data channel creation failed: {0}")]
    DataChannel(String),

    #[error("peer connection close failed: {0}")]
    EngineClose(String),

    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("missing target peer")]
    MissingTarget,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("candidate gathering timed out after {secs}s")]
    GatheringTimeout { secs: u64 },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse error classes used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Ends the affected connection's read loop, never the process.
    Transport,
    /// The offending message is logged and dropped.
    Parse,
    /// Aborts the current flow with exactly one error reply.
    Engine,
    /// Error reply, no state mutation.
    Protocol,
    /// Gathering did not complete in time.
    Timeout,
    Config,
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Transport(_) | RelayError::NoActiveConnection | RelayError::Io(_) => {
                ErrorKind::Transport
            }
            RelayError::Parse(_)
            | RelayError::PayloadParse(_)
            | RelayError::FrameTooLarge { .. } => ErrorKind::Parse,
            RelayError::EngineInit(_)
            | RelayError::OfferCreation(_)
            | RelayError::LocalDescription(_)
            | RelayError::RemoteDescription(_)
            | RelayError::Candidate(_)
            | RelayError::DataChannel(_)
            | RelayError::EngineClose(_) => ErrorKind::Engine,
            RelayError::UnknownCommand(_)
            | RelayError::MissingTarget
            | RelayError::SessionNotFound(_) => ErrorKind::Protocol,
            RelayError::GatheringTimeout { .. } => ErrorKind::Timeout,
            RelayError::Config(_) => ErrorKind::Config,
        }
    }

    /// Text sent to the control client in an `error` reply.
    ///
    /// Engine detail stays in the log; the client gets a short stable message.
    pub fn reply_text(&self) -> String {
        match self {
            RelayError::EngineInit(_) => "Failed to create PeerConnection".into(),
            RelayError::OfferCreation(_) => "Failed to create SDP offer".into(),
            RelayError::LocalDescription(_) => "Failed to set local description".into(),
            RelayError::RemoteDescription(_) => "Failed to set remote description".into(),
            RelayError::Candidate(_) => "Failed to add ICE candidate".into(),
            RelayError::DataChannel(_) => "Failed to create data channel".into(),
            RelayError::EngineClose(_) => "Failed to close PeerConnection".into(),
            RelayError::PayloadParse(_) => "Invalid connection details".into(),
            RelayError::MissingTarget => "Missing user field in message".into(),
            RelayError::UnknownCommand(_) => "Unknown command type".into(),
            RelayError::SessionNotFound(_) => "Unknown peer".into(),
            RelayError::GatheringTimeout { secs } => {
                format!("Timed out after {secs}s waiting for ICE gathering")
            }
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::Parse(e.to_string())
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
