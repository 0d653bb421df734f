#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("lock data {lock_data:?} contains reserved token {reserved:?}")]
    InvalidLockData { lock_data: String, reserved: String },
    #[error("peer '{peer}' has no open status stream")]
    Disconnected { peer: String },
    #[error("redis error")]
    Redis(#[from] redis::RedisError),
    #[error("rpc failed")]
    Rpc(#[from] tonic::Status),
    #[error("transport error")]
    Transport(#[from] tonic::transport::Error),
    #[error("store has been shut down")]
    ShutDown,
}
