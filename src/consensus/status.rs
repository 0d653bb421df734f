use crate::store::StoreError;
use chrono::{DateTime, Utc};

/// Joins the lock data of several busy instances into one string, and splits it back apart.
/// Lock data must never contain it.
pub const LOCK_DATA_SEPARATOR: &str = "#REACTIVELOCK#";

/// The last status one instance published for a lock key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstancePeerStatus {
    pub instance_id: String,
    pub is_busy: bool,
    pub lock_data: Option<String>,
    /// Lease end. A busy status past its lease counts as idle. `None` never expires.
    pub valid_until: Option<DateTime<Utc>>,
}

impl InstancePeerStatus {
    pub fn is_busy_at(&self, now: DateTime<Utc>) -> bool {
        self.is_busy && self.valid_until.map_or(true, |valid_until| valid_until > now)
    }
}

pub fn split_lock_data(data: &str) -> Vec<String> {
    data.split(LOCK_DATA_SEPARATOR)
        .filter(|entry| !entry.is_empty())
        .map(String::from)
        .collect()
}

/// Rejects lock data that would be ambiguous once merged with other instances' data or
/// embedded in a backend encoding. `reserved` lists backend-specific delimiters.
pub fn validate_lock_data(lock_data: Option<&str>, reserved: &[&str]) -> Result<(), StoreError> {
    let data = match lock_data {
        Some(data) => data,
        None => return Ok(()),
    };

    let conflict = std::iter::once(LOCK_DATA_SEPARATOR)
        .chain(reserved.iter().copied())
        .find(|token| data.contains(*token));

    match conflict {
        Some(token) => Err(StoreError::InvalidLockData {
            lock_data: data.to_string(),
            reserved: token.to_string(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_drops_empty_entries() {
        let data = format!("a{0}{0}b{0}", LOCK_DATA_SEPARATOR);
        assert_eq!(split_lock_data(&data), vec!["a", "b"]);
        assert!(split_lock_data("").is_empty());
    }

    #[test]
    fn split_keeps_whitespace_entries() {
        let data = format!("a{0} {0}b", LOCK_DATA_SEPARATOR);
        assert_eq!(split_lock_data(&data), vec!["a", " ", "b"]);
    }

    #[test]
    fn validate_rejects_separator_and_reserved_tokens() {
        assert!(validate_lock_data(None, &[";"]).is_ok());
        assert!(validate_lock_data(Some("plain"), &[";"]).is_ok());

        let merged = format!("a{}b", LOCK_DATA_SEPARATOR);
        assert!(matches!(
            validate_lock_data(Some(&merged), &[]),
            Err(StoreError::InvalidLockData { .. })
        ));
        assert!(matches!(
            validate_lock_data(Some("a;b"), &[";"]),
            Err(StoreError::InvalidLockData { reserved, .. }) if reserved == ";"
        ));
    }
}
