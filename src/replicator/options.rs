use crate::replicator::retry::{FixedBackoff, RetryPolicy};
use chrono::{DateTime, Utc};
use std::convert::TryFrom;
use std::sync::Arc;
use tokio::time::Duration;

/// Timing of a `ResilientReplicator`. Unset fields take the documented defaults.
#[derive(Clone, Default)]
pub struct ReplicatorOptions {
    /// How often every delivered status is re-sent with a fresh lease. Default 5s.
    pub renewal_period: Option<Duration>,
    /// Lease length stamped on every write. Must exceed `renewal_period`. Default 10s.
    pub expiration_period: Option<Duration>,
    /// How often undelivered statuses are re-executed. Default 15s.
    pub recover_period: Option<Duration>,
    /// Default retries forever, once per second.
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReplicatorOptionsError {
    #[error("{0} must be greater than zero")]
    ZeroPeriod(&'static str),
    #[error("renewal period {renewal:?} must be less than expiration period {expiration:?}")]
    RenewalNotBeforeExpiration { renewal: Duration, expiration: Duration },
    #[error("expiration period {0:?} is out of range")]
    ExpirationOutOfRange(Duration),
}

#[derive(Clone)]
pub(crate) struct ReplicatorOptionsValidated {
    pub renewal_period: Duration,
    pub expiration_period: Duration,
    pub recover_period: Duration,
    pub retry_policy: Arc<dyn RetryPolicy>,
    lease: chrono::Duration,
}

impl ReplicatorOptionsValidated {
    /// End of the lease for a write made now.
    pub fn lease_deadline(&self) -> DateTime<Utc> {
        Utc::now() + self.lease
    }

    fn validate(&self) -> Result<(), ReplicatorOptionsError> {
        if self.renewal_period == Duration::from_secs(0) {
            return Err(ReplicatorOptionsError::ZeroPeriod("renewal period"));
        }
        if self.recover_period == Duration::from_secs(0) {
            return Err(ReplicatorOptionsError::ZeroPeriod("recover period"));
        }
        if self.renewal_period >= self.expiration_period {
            return Err(ReplicatorOptionsError::RenewalNotBeforeExpiration {
                renewal: self.renewal_period,
                expiration: self.expiration_period,
            });
        }

        Ok(())
    }
}

impl TryFrom<ReplicatorOptions> for ReplicatorOptionsValidated {
    type Error = ReplicatorOptionsError;

    fn try_from(options: ReplicatorOptions) -> Result<Self, Self::Error> {
        let expiration_period = options.expiration_period.unwrap_or(Duration::from_secs(10));
        let lease = chrono::Duration::from_std(expiration_period)
            .map_err(|_| ReplicatorOptionsError::ExpirationOutOfRange(expiration_period))?;

        let values = ReplicatorOptionsValidated {
            renewal_period: options.renewal_period.unwrap_or(Duration::from_secs(5)),
            expiration_period,
            recover_period: options.recover_period.unwrap_or(Duration::from_secs(15)),
            retry_policy: options
                .retry_policy
                .unwrap_or_else(|| Arc::new(FixedBackoff::default())),
            lease,
        };

        values.validate()?;
        Ok(values)
    }
}
