//! Task persistence backends for tasklane.
//!
//! - [`FileTaskStore`]: one directory per task plus a JSONL index
//! - [`InMemoryTaskStore`]: kept in memory, for tests

pub mod file;
pub mod in_memory;

pub use file::FileTaskStore;
pub use in_memory::InMemoryTaskStore;
