mod consensus;
mod controller;
mod gate;
mod grpc_store;
mod logging;
mod redis_store;
mod registry;
mod replicator;
mod server;
mod store;
mod grpc {
    include!("../generated/reactivelock.rs");
}

pub use consensus::are_all_idle;
pub use consensus::split_lock_data;
pub use consensus::ConsensusVerdict;
pub use consensus::InstancePeerStatus;
pub use consensus::LOCK_DATA_SEPARATOR;
pub use controller::CounterCreationError;
pub use controller::UsageCounter;
pub use gate::GateHandlers;
pub use gate::LockGate;
pub use gate::LockHandler;
pub use gate::WaitOptions;
pub use grpc_store::RpcStore;
pub use grpc_store::RpcStoreConfig;
pub use grpc_store::RpcStoreCreationError;
pub use logging::create_root_logger_for_stdout;
pub use redis_store::channel_name;
pub use redis_store::hash_key;
pub use redis_store::HashChannel;
pub use redis_store::InMemoryHashChannel;
pub use redis_store::RedisHashChannel;
pub use redis_store::RedisStore;
pub use redis_store::RedisStoreConfig;
pub use redis_store::RedisStoreError;
pub use registry::LockRegistry;
pub use registry::RegistryError;
pub use replicator::replication_action;
pub use replicator::FixedBackoff;
pub use replicator::NoRetry;
pub use replicator::ReplicationAction;
pub use replicator::ReplicatorOptions;
pub use replicator::ReplicatorOptionsError;
pub use replicator::ResilientReplicator;
pub use replicator::RetryPolicy;
pub use server::shutdown_signal;
pub use server::LockStatusServer;
pub use server::LockStatusServerOptions;
pub use server::LockStatusServerShutdownHandle;
pub use server::LockStatusServerShutdownSignal;
pub use store::LocalStore;
pub use store::LockStatusStore;
pub use store::StoreError;
