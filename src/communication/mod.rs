//! The seam between the dispatch engine and the compute servers.
//!
//! Remote channels talk to a server through a [`TaskServerConnection`]. The crate ships
//! an in-process [`LoopbackConnection`]; network transports implement the same trait.

// Private submodules
mod codebase;
mod connection;
mod errors;
mod loopback;
mod management;

// Public exports
pub use codebase::CodebaseRegistry;
pub use connection::{
    prepare_bundle, BundleHeader, OutboundBundle, ResultBatch, TaskServerConnection,
};
pub use errors::CommunicationError;
pub use loopback::LoopbackConnection;
pub use management::{ManagementClient, RecordingManagementClient};
