//! The client-facing surface of the library: node wiring, the per-replica client handle, and
//! tunable options. Everything else in the crate is plumbing behind this mod.

mod client;
mod options;
mod wiring;

pub use client::RaftClient;
pub use client::RaftEntryId;
pub use client::ReadOutput;
pub use client::RequestError;
pub use client::SnapshotError;
pub use client::SnapshotOutput;
pub use client::WriteOutput;
pub use options::RaftOptions;
pub use wiring::try_create_node;
pub use wiring::NodeCreationError;
pub use wiring::NodeStorage;
pub use wiring::RaftNode;
pub use wiring::RaftNodeConfig;
