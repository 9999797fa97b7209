mod disk;
mod in_memory;
mod log;

pub use disk::DiskLog;
pub use in_memory::InMemoryLog;
pub use log::Entry;
pub use log::Index;
pub use log::Log;
