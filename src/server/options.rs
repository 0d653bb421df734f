use std::convert::TryFrom;
use tokio::time::Duration;

#[derive(Clone, Default)]
pub struct LockStatusServerOptions {
    /// How often expired statuses are pruned. Default 10s.
    pub prune_period: Option<Duration>,
    /// How long a status is kept after its lease ended. Default 60s.
    pub expired_retention: Option<Duration>,
}

pub(super) struct LockStatusServerOptionsValidated {
    pub prune_period: Duration,
    pub expired_retention: chrono::Duration,
}

impl TryFrom<LockStatusServerOptions> for LockStatusServerOptionsValidated {
    type Error = &'static str;

    fn try_from(options: LockStatusServerOptions) -> Result<Self, Self::Error> {
        let prune_period = options.prune_period.unwrap_or(Duration::from_secs(10));
        if prune_period == Duration::from_secs(0) {
            return Err("Prune period must be greater than zero");
        }

        let expired_retention = options.expired_retention.unwrap_or(Duration::from_secs(60));
        let expired_retention =
            chrono::Duration::from_std(expired_retention).map_err(|_| "Expired retention is out of range")?;

        Ok(LockStatusServerOptionsValidated {
            prune_period,
            expired_retention,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = LockStatusServerOptionsValidated::try_from(LockStatusServerOptions::default()).unwrap();

        assert_eq!(options.prune_period, Duration::from_secs(10));
        assert_eq!(options.expired_retention, chrono::Duration::seconds(60));
    }

    #[test]
    fn zero_prune_period_is_rejected() {
        let options = LockStatusServerOptions {
            prune_period: Some(Duration::from_secs(0)),
            ..Default::default()
        };

        assert!(LockStatusServerOptionsValidated::try_from(options).is_err());
    }
}
