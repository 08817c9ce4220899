//! 共享记忆层：跨进程协调与审计的键值存储（内存 / SQLite）

pub mod shared;

pub use shared::{keys, open_shared_memory, InMemorySharedMemory, SharedMemory, SqliteSharedMemory};
