pub mod memory;
pub mod sqlite;

pub use memory::MemoryChunkStore;
pub use sqlite::SqliteChunkStore;
