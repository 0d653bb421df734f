use crate::consensus::InstancePeerStatus;
use crate::grpc::{InstanceLockStatus, LockStatusNotification};
use chrono::{DateTime, TimeZone, Utc};

/// Wire timestamps are Unix epoch milliseconds, 0 meaning "never expires".
pub(crate) fn timestamp_from_millis(millis: i64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        return None;
    }
    Utc.timestamp_millis_opt(millis).single()
}

pub(crate) fn millis_from_timestamp(timestamp: Option<DateTime<Utc>>) -> i64 {
    timestamp.map_or(0, |t| t.timestamp_millis())
}

/// Empty lock data on the wire means none.
fn lock_data_from_wire(lock_data: &str) -> Option<String> {
    if lock_data.is_empty() {
        None
    } else {
        Some(lock_data.to_string())
    }
}

pub(crate) fn peer_status(instance_id: &str, status: &InstanceLockStatus) -> InstancePeerStatus {
    InstancePeerStatus {
        instance_id: instance_id.to_string(),
        is_busy: status.is_busy,
        lock_data: lock_data_from_wire(&status.lock_data),
        valid_until: timestamp_from_millis(status.valid_until_millis),
    }
}

pub(crate) fn peer_statuses(notification: &LockStatusNotification) -> Vec<InstancePeerStatus> {
    notification
        .instances_status
        .iter()
        .map(|(instance_id, status)| peer_status(instance_id, status))
        .collect()
}
