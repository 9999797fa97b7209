mod command;
mod store;

pub use command::Command;
pub use command::DecodeError;
pub use command::Operation;
pub use store::KvStore;
