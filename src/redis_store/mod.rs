//! Lock status sharing through a Redis hash plus a pub/sub channel per lock key.
mod backend;
mod encoding;
mod in_memory;
mod store;

pub use backend::HashChannel;
pub use backend::RedisHashChannel;
pub use encoding::channel_name;
pub use encoding::hash_key;
pub use in_memory::InMemoryHashChannel;
pub use store::RedisStore;
pub use store::RedisStoreConfig;
pub use store::RedisStoreError;
