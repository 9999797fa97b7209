mod actor;
mod api;
mod commitlog;
mod kv;
mod replica;
mod snapshot;
mod testkit;
mod transport;

pub use api::try_create_node;
pub use api::NodeCreationError;
pub use api::NodeStorage;
pub use api::RaftClient;
pub use api::RaftEntryId;
pub use api::RaftNode;
pub use api::RaftNodeConfig;
pub use api::RaftOptions;
pub use api::ReadOutput;
pub use api::RequestError;
pub use api::SnapshotError;
pub use api::SnapshotOutput;
pub use api::WriteOutput;

pub use commitlog::Index;

pub use replica::AppendEntriesError;
pub use replica::AppendEntriesInput;
pub use replica::AppendEntriesLogEntry;
pub use replica::AppendEntriesOutput;
pub use replica::ElectionStateChangeListener;
pub use replica::ElectionStateSnapshot;
pub use replica::InstallSnapshotError;
pub use replica::InstallSnapshotInput;
pub use replica::InstallSnapshotOutput;
pub use replica::ReplicaId;
pub use replica::RequestVoteError;
pub use replica::RequestVoteInput;
pub use replica::RequestVoteOutput;
pub use replica::StatusReport;
pub use replica::Term;
pub use replica::TermOutOfDateInfo;

pub use transport::MessageDisposition;
pub use transport::MessageRecord;
pub use transport::NetworkConditions;
pub use transport::RpcKind;
pub use transport::RpcResult;
pub use transport::SimulatedNetwork;
pub use transport::SimulatedTransport;
pub use transport::Transport;
pub use transport::TransportError;

pub use testkit::create_root_logger_for_discard;
pub use testkit::create_root_logger_for_file;
pub use testkit::create_root_logger_for_stdout;
pub use testkit::replica_id;
pub use testkit::HistoryAction;
pub use testkit::HistoryChecker;
pub use testkit::InvariantChecker;
pub use testkit::SimCluster;
pub use testkit::WaitError;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.
