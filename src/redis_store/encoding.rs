use crate::consensus::InstancePeerStatus;
use chrono::{DateTime, TimeZone, Utc};

/// Delimits the fields of an encoded status. Lock data must never contain it.
pub(crate) const FIELD_DELIMITER: &str = ";";

const HASH_KEY_PREFIX: &str = "ReactiveLock:Redis:HashSet:";
const CHANNEL_PREFIX: &str = "ReactiveLock:Redis:HashSetNotifier:";

pub fn hash_key(lock_key: &str) -> String {
    format!("{}{}", HASH_KEY_PREFIX, lock_key)
}

pub fn channel_name(lock_key: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, lock_key)
}

/// Encodes a status as `"<1|0>;<lock_data>;<valid_until_millis>"`. Absent fields are left
/// empty.
pub fn encode_status(is_busy: bool, lock_data: Option<&str>, valid_until: Option<DateTime<Utc>>) -> String {
    format!(
        "{}{}{}{}{}",
        if is_busy { "1" } else { "0" },
        FIELD_DELIMITER,
        lock_data.unwrap_or(""),
        FIELD_DELIMITER,
        valid_until.map(|t| t.timestamp_millis().to_string()).unwrap_or_default(),
    )
}

/// Decodes a hash field value. Values written before leases existed (`"1"`, `"1;data"`) decode
/// as never expiring, and an unreadable timestamp is treated the same way.
pub fn decode_status(instance_id: &str, value: &str) -> InstancePeerStatus {
    let mut fields = value.splitn(3, FIELD_DELIMITER);
    let is_busy = fields.next().map_or(false, |flag| flag.trim() == "1");
    let lock_data = fields.next().filter(|data| !data.is_empty()).map(String::from);
    let valid_until = fields
        .next()
        .and_then(|millis| millis.trim().parse::<i64>().ok())
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single());

    InstancePeerStatus {
        instance_id: instance_id.to_string(),
        is_busy,
        lock_data,
        valid_until,
    }
}
