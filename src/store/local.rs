use crate::gate::LockGate;
use crate::store::{LockStatusStore, StoreError};
use std::sync::Arc;

/// Single-process store: a status change flips the gate directly.
pub struct LocalStore {
    gate: Arc<LockGate>,
}

impl LocalStore {
    pub fn new(gate: Arc<LockGate>) -> Self {
        LocalStore { gate }
    }
}

#[async_trait::async_trait]
impl LockStatusStore for LocalStore {
    async fn set_status(&self, _instance_name: &str, is_busy: bool, lock_data: Option<&str>) -> Result<(), StoreError> {
        if is_busy {
            self.gate.set_blocked(lock_data.map(String::from));
        } else {
            self.gate.set_unblocked();
        }
        Ok(())
    }
}
