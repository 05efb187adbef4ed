/// Git smart protocol (v0) served over HTTP and SSH.
///
/// The wire pieces (pkt-line, advertisement, negotiation, side-band) are transport-agnostic and
/// are driven by a [`session::Session`] over any byte reader/writer pair. [`http`] and [`ssh`]
/// only adapt their transport onto that pair and translate the outcome into a status code or an
/// exit status.
pub mod access;
pub mod advertise;
pub mod http;
pub mod pktline;
pub mod receive;
pub mod session;
pub mod sideband;
pub mod ssh;
pub mod types;
pub mod upload;

// Re-export main interfaces
pub use access::{AccessControl, AllowAll, Peer, ReadOnly, ServicePolicy};
pub use session::{Session, SessionContext, SessionState};
pub use types::*;
