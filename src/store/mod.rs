mod error;
mod local;

pub use error::StoreError;
pub use local::LocalStore;

/// Persists and propagates busy/idle transitions of named instances sharing one lock key.
///
/// Implementations fail only on unrecoverable errors. Transient backend failures are
/// retried behind the call and never surface here.
#[async_trait::async_trait]
pub trait LockStatusStore: Send + Sync {
    async fn set_status(&self, instance_name: &str, is_busy: bool, lock_data: Option<&str>) -> Result<(), StoreError>;
}
