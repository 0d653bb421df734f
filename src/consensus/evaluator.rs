use crate::consensus::status::{InstancePeerStatus, LOCK_DATA_SEPARATOR};
use crate::gate::LockGate;
use chrono::{DateTime, Utc};
use tokio::time::Duration;

// Wall clock and timer clock are not the same clock.
const EXPIRY_SLACK: Duration = Duration::from_millis(5);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConsensusVerdict {
    pub all_idle: bool,
    /// Lock data of every live busy instance, joined with `LOCK_DATA_SEPARATOR`.
    pub lock_data: Option<String>,
    /// Earliest lease end among the live busy instances. The verdict may flip to idle at this
    /// instant even if no instance publishes anything new.
    pub next_expiry: Option<DateTime<Utc>>,
}

impl ConsensusVerdict {
    fn idle() -> Self {
        ConsensusVerdict {
            all_idle: true,
            lock_data: None,
            next_expiry: None,
        }
    }
}

/// Decides whether every instance of a lock key is idle as of `now`.
///
/// A busy status whose lease ended counts as idle, so an instance that crashed while busy
/// cannot hold its peers blocked past its lease. The order of the merged lock data follows
/// the iteration order of `statuses`.
pub fn are_all_idle<'a, I>(statuses: I, now: DateTime<Utc>) -> ConsensusVerdict
where
    I: IntoIterator<Item = &'a InstancePeerStatus>,
{
    let busy: Vec<&InstancePeerStatus> = statuses.into_iter().filter(|s| s.is_busy_at(now)).collect();
    if busy.is_empty() {
        return ConsensusVerdict::idle();
    }

    let lock_data: Vec<&str> = busy
        .iter()
        .filter_map(|s| s.lock_data.as_deref())
        .filter(|data| !data.is_empty())
        .collect();
    let lock_data = if lock_data.is_empty() {
        None
    } else {
        Some(lock_data.join(LOCK_DATA_SEPARATOR))
    };

    ConsensusVerdict {
        all_idle: false,
        lock_data,
        next_expiry: busy.iter().filter_map(|s| s.valid_until).min(),
    }
}

/// Applies a verdict to the local gate.
pub fn drive_gate(gate: &LockGate, verdict: &ConsensusVerdict) {
    if verdict.all_idle {
        gate.set_unblocked();
    } else {
        gate.set_blocked(verdict.lock_data.clone());
    }
}

/// Resolves shortly after `next_expiry`, or never if there is none. Subscribers race it against
/// incoming notifications so that a lapsed lease is noticed without anyone publishing.
pub async fn expiry_timer(next_expiry: Option<DateTime<Utc>>) {
    match next_expiry {
        Some(expiry) => {
            let remaining = (expiry - Utc::now()).to_std().unwrap_or_else(|_| Duration::from_millis(0));
            tokio::time::sleep(remaining + EXPIRY_SLACK).await;
        }
        None => futures::future::pending::<()>().await,
    }
}
