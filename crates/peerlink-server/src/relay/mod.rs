//! Peer connection sessions: the registry and the coordinator that drives
//! each session's state machine.

pub mod coordinator;
pub mod registry;

pub use coordinator::SessionCoordinator;
pub use registry::PeerConnectionRegistry;
