//! Tooling for driving a cluster of replicas over the simulated network in tests: cluster
//! setup and fault injection, safety/linearizability checkers, and logger builders.
//!
//! Ships in the library (not behind `cfg(test)`) so that integration tests and downstream
//! crates' simulations can use it.

mod checkers;
mod logging;
mod sim_cluster;

pub use checkers::HistoryAction;
pub use checkers::HistoryChecker;
pub use checkers::InvariantChecker;
pub use logging::create_root_logger_for_discard;
pub use logging::create_root_logger_for_file;
pub use logging::create_root_logger_for_stdout;
pub use sim_cluster::replica_id;
pub use sim_cluster::SimCluster;
pub use sim_cluster::WaitError;
