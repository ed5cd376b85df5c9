pub mod cache;
pub mod file;
pub mod memory;
pub mod redis_store;

pub use cache::{KeyValueStore, StatusCache, STATUS_CACHE_KEY_PREFIX};
pub use file::FileKeyValueStore;
pub use memory::MemoryKeyValueStore;
pub use redis_store::RedisKeyValueStore;
