use crate::grpc::{InstanceLockStatus, LockStatusNotification, LockStatusRequest};
use crate::grpc_store::timestamp_from_millis;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::watch;

/// The statuses every instance reported, per lock key. Each lock key publishes its full
/// snapshot on a watch channel whenever it changes; a slow subscriber only sees the latest.
pub(crate) struct StatusTable {
    locks: Mutex<HashMap<String, LockEntry>>,
}

struct LockEntry {
    instances: HashMap<String, InstanceLockStatus>,
    snapshots: watch::Sender<LockStatusNotification>,
}

impl LockEntry {
    fn new(lock_key: &str) -> Self {
        let (snapshots, _) = watch::channel(LockStatusNotification {
            lock_key: lock_key.to_string(),
            instances_status: HashMap::new(),
        });
        LockEntry {
            instances: HashMap::new(),
            snapshots,
        }
    }

    fn publish(&self, lock_key: &str) {
        self.snapshots.send_replace(LockStatusNotification {
            lock_key: lock_key.to_string(),
            instances_status: self.instances.clone(),
        });
    }
}

impl StatusTable {
    pub fn new() -> Self {
        StatusTable {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Records the status carried by `request` and publishes the new snapshot of its lock key.
    pub fn upsert(&self, request: LockStatusRequest) {
        let mut locks = self.lock_locks();
        let entry = locks
            .entry(request.lock_key.clone())
            .or_insert_with(|| LockEntry::new(&request.lock_key));
        entry.instances.insert(
            request.instance_id,
            InstanceLockStatus {
                is_busy: request.is_busy,
                lock_data: request.lock_data,
                valid_until_millis: request.valid_until_millis,
            },
        );
        entry.publish(&request.lock_key);
    }

    /// Snapshots of `lock_key`, starting with the current one.
    pub fn subscribe(&self, lock_key: &str) -> watch::Receiver<LockStatusNotification> {
        self.lock_locks()
            .entry(lock_key.to_string())
            .or_insert_with(|| LockEntry::new(lock_key))
            .snapshots
            .subscribe()
    }

    #[cfg(test)]
    pub fn snapshot(&self, lock_key: &str) -> Option<LockStatusNotification> {
        self.lock_locks()
            .get(lock_key)
            .map(|entry| entry.snapshots.borrow().clone())
    }

    /// Drops statuses whose lease ended before `cutoff`, and lock keys left with neither
    /// statuses nor subscribers. Returns the number of dropped statuses.
    pub fn prune_expired(&self, cutoff: DateTime<Utc>) -> usize {
        let mut pruned = 0;
        let mut locks = self.lock_locks();

        for (lock_key, entry) in locks.iter_mut() {
            let before = entry.instances.len();
            entry.instances.retain(|_, status| {
                timestamp_from_millis(status.valid_until_millis).map_or(true, |valid_until| valid_until >= cutoff)
            });
            let removed = before - entry.instances.len();
            if removed > 0 {
                pruned += removed;
                entry.publish(lock_key);
            }
        }
        locks.retain(|_, entry| !entry.instances.is_empty() || entry.snapshots.receiver_count() > 0);

        pruned
    }

    fn lock_locks(&self) -> std::sync::MutexGuard<'_, HashMap<String, LockEntry>> {
        self.locks.lock().expect("StatusTable mutex guard poison")
    }
}
