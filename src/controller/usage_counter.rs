use crate::store::{LockStatusStore, StoreError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// UsageCounter turns overlapping busy/idle calls from many producers into single busy and
/// idle edges for one instance.
///
/// The store only hears about the count crossing `busy_threshold` on the way up, and about it
/// reaching zero on the way down.
pub struct UsageCounter {
    store: Arc<dyn LockStatusStore>,
    instance_name: String,
    busy_threshold: u64,
    count: AtomicU64,
}

#[derive(Debug, thiserror::Error)]
pub enum CounterCreationError {
    #[error("busy threshold must be at least 1, got {0}")]
    InvalidBusyThreshold(u64),
    #[error("instance name must not be empty")]
    EmptyInstanceName,
}

impl UsageCounter {
    pub fn new(
        store: Arc<dyn LockStatusStore>,
        instance_name: impl Into<String>,
        busy_threshold: u64,
    ) -> Result<Self, CounterCreationError> {
        let instance_name = instance_name.into();
        if busy_threshold < 1 {
            return Err(CounterCreationError::InvalidBusyThreshold(busy_threshold));
        }
        if instance_name.trim().is_empty() {
            return Err(CounterCreationError::EmptyInstanceName);
        }

        Ok(UsageCounter {
            store,
            instance_name,
            busy_threshold,
            count: AtomicU64::new(0),
        })
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    /// Marks one more unit of usage. The call that lifts the count to the busy threshold
    /// reports the instance busy with `lock_data`.
    pub async fn increment(&self, lock_data: Option<&str>) -> Result<(), StoreError> {
        let next = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if next == self.busy_threshold {
            self.store.set_status(&self.instance_name, true, lock_data).await?;
        }
        Ok(())
    }

    /// Releases `amount` units of usage, clamping at zero. The call that brings the count
    /// back to zero reports the instance idle.
    pub async fn decrement(&self, amount: u64) -> Result<(), StoreError> {
        let mut current = self.count.load(Ordering::SeqCst);
        let next = loop {
            let next = current.saturating_sub(amount);
            match self
                .count
                .compare_exchange_weak(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break next,
                Err(actual) => current = actual,
            }
        };

        if current > 0 && next == 0 {
            self.store.set_status(&self.instance_name, false, None).await?;
        }
        Ok(())
    }
}
