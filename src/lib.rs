//! git-gateway: serves a directory of git repositories over the smart protocol, on HTTP and SSH.
//!
//! Modules
//! - `resolve`: maps client-supplied repository names onto git directories under the scan root.
//! - `protocol`: pkt-line codec, capabilities, ref advertisement, upload-pack negotiation,
//!   receive-pack ref updates, side-band multiplexing, the per-request session state machine,
//!   access control and the HTTP/SSH bindings.
//! - `store`: the repository store the protocol runs against, in memory or on disk.
//! - `internal::object` / `internal::pack`: object parsing and the pack format.
//! - `gateway`: state shared by the bindings; `config`: YAML configuration.
//! - `errors`: unified error types. `hash`: object ids for SHA-1 and SHA-256 repositories.

pub mod config;
pub mod errors;
pub mod gateway;
pub mod hash;
pub mod internal;
pub mod protocol;
pub mod resolve;
pub mod store;

pub use errors::GatewayError;
pub use gateway::Gateway;
pub use protocol::{AccessControl, ProtocolError, ServiceType, Session, SessionContext};
pub use store::{RepositoryStore, StoreError};
