mod store;

pub use store::DiskSnapshotStore;
pub use store::InMemorySnapshotStore;
pub use store::Snapshot;
pub use store::SnapshotStore;
