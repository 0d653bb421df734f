//! Lock status sharing through lock status servers over gRPC.
mod convert;
mod peer;
mod store;

pub(crate) use convert::timestamp_from_millis;
pub use store::RpcStore;
pub use store::RpcStoreConfig;
pub use store::RpcStoreCreationError;
