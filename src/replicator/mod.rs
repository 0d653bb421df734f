mod options;
mod replicator;
mod retry;

pub use options::ReplicatorOptions;
pub use options::ReplicatorOptionsError;
pub(crate) use options::ReplicatorOptionsValidated;
pub use replicator::replication_action;
pub use replicator::ReplicationAction;
pub use replicator::ResilientReplicator;
pub use retry::FixedBackoff;
pub use retry::NoRetry;
pub use retry::RetryPolicy;
