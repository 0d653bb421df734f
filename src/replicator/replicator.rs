use crate::replicator::{ReplicatorOptions, ReplicatorOptionsError, ReplicatorOptionsValidated};
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// One write to a backend. It receives the lease deadline to stamp on the written status and
/// may be invoked any number of times.
pub type ReplicationAction = Arc<dyn Fn(DateTime<Utc>) -> BoxFuture<'static, Result<(), StoreError>> + Send + Sync>;

pub fn replication_action<F, Fut>(action: F) -> ReplicationAction
where
    F: Fn(DateTime<Utc>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), StoreError>> + Send + 'static,
{
    Arc::new(move |valid_until| Box::pin(action(valid_until)))
}

/// ResilientReplicator gives backend writes at-least-once delivery.
///
/// Writes are grouped by replication key. A newer `execute` for a key supersedes whatever is
/// still pending for it, and writes of one key never overlap. Every write carries a lease,
/// which a background loop keeps renewing for the latest write of each key. A second loop
/// re-executes writes whose retries were exhausted.
pub struct ResilientReplicator {
    inner: Arc<Inner>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    logger: slog::Logger,
    options: ReplicatorOptionsValidated,
    entries: Mutex<HashMap<String, Entry>>,
    in_flight: AtomicUsize,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

struct Entry {
    current: ReplicationAction,
    pending: Option<Pending>,
    // Serializes every write of this key.
    lane: Arc<tokio::sync::Mutex<()>>,
}

struct Pending {
    token: CancellationToken,
    generation: u64,
    retrying: bool,
}

/// A registered write, ready to run.
struct Delivery {
    key: String,
    action: ReplicationAction,
    token: CancellationToken,
    generation: u64,
    lane: Arc<tokio::sync::Mutex<()>>,
}

impl ResilientReplicator {
    pub fn new(logger: slog::Logger, options: ReplicatorOptions) -> Result<Self, ReplicatorOptionsError> {
        let options = ReplicatorOptionsValidated::try_from(options)?;
        let renewal_period = options.renewal_period;
        let recover_period = options.recover_period;

        let inner = Arc::new(Inner {
            logger,
            options,
            entries: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        let loops = vec![
            tokio::task::spawn(run_periodically(Arc::downgrade(&inner), renewal_period, Inner::renew_all)),
            tokio::task::spawn(run_periodically(Arc::downgrade(&inner), recover_period, Inner::recover)),
        ];

        Ok(ResilientReplicator {
            inner,
            loops: Mutex::new(loops),
        })
    }

    /// Registers `action` as the latest write for `key` and delivers it, retrying under the
    /// configured policy. Returns once the write succeeded, was superseded by a newer write for
    /// the same key, or ran out of retries. Failures are logged, never returned.
    pub async fn execute(&self, key: &str, action: ReplicationAction) {
        let delivery = self.inner.register(key, action);
        self.inner.deliver(delivery).await;
    }

    /// Like `execute`, but delivers on a spawned task. Registration happens before this
    /// returns, so a later `execute` for the same key always supersedes this one.
    pub fn spawn_execute(&self, key: &str, action: ReplicationAction) -> JoinHandle<()> {
        let delivery = self.inner.register(key, action);
        let inner = self.inner.clone();
        tokio::task::spawn(async move { inner.deliver(delivery).await })
    }

    /// Re-executes every write whose retries were exhausted, and waits for those deliveries.
    pub async fn flush_pending(&self) {
        self.inner.flush_pending().await;
    }

    /// Drops `key` entirely: its pending delivery stops and it is no longer renewed.
    pub fn forget(&self, key: &str) {
        if let Some(entry) = self.inner.lock_entries().remove(key) {
            if let Some(pending) = entry.pending {
                pending.token.cancel();
            }
            slog::debug!(self.inner.logger, "Forgot replication key '{}'", key);
        }
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.inner
            .lock_entries()
            .get(key)
            .map_or(false, |entry| entry.pending.is_some())
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Lease end for a write made now.
    pub fn lease_deadline(&self) -> DateTime<Utc> {
        self.inner.options.lease_deadline()
    }

    /// Stops the background loops and cancels every pending delivery.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let loops: Vec<JoinHandle<()>> = self.lock_loops().drain(..).collect();
        for result in future::join_all(loops).await {
            if let Err(e) = result {
                slog::warn!(self.inner.logger, "Replicator loop exited abnormally: {:?}", e);
            }
        }
        slog::info!(self.inner.logger, "Replicator shut down.");
    }

    fn lock_loops(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.loops.lock().expect("ResilientReplicator loops mutex guard poison")
    }
}

impl Drop for ResilientReplicator {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().expect("ResilientReplicator entries mutex guard poison")
    }

    fn register(&self, key: &str, action: ReplicationAction) -> Delivery {
        let token = self.shutdown.child_token();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);

        let mut entries = self.lock_entries();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            current: action.clone(),
            pending: None,
            lane: Arc::new(tokio::sync::Mutex::new(())),
        });
        if let Some(superseded) = entry.pending.take() {
            superseded.token.cancel();
        }
        entry.current = action.clone();
        entry.pending = Some(Pending {
            token: token.clone(),
            generation,
            retrying: true,
        });

        Delivery {
            key: key.to_string(),
            action,
            token,
            generation,
            lane: entry.lane.clone(),
        }
    }

    /// Registers the current write of `key` again if its delivery `generation` is still the
    /// latest one and has given up retrying.
    fn reregister(&self, key: &str, generation: u64) -> Option<Delivery> {
        let current = {
            let entries = self.lock_entries();
            let entry = entries.get(key)?;
            match &entry.pending {
                Some(pending) if pending.generation == generation && !pending.retrying => entry.current.clone(),
                _ => return None,
            }
        };
        Some(self.register(key, current))
    }

    async fn deliver(&self, delivery: Delivery) {
        let mut failed_attempts = 0;
        loop {
            if delivery.token.is_cancelled() {
                slog::debug!(self.logger, "Write for '{}' superseded", delivery.key);
                return;
            }

            let result = {
                let _lane = delivery.lane.lock().await;
                if delivery.token.is_cancelled() {
                    continue;
                }
                let _in_flight = InFlight::enter(&self.in_flight);
                (delivery.action)(self.options.lease_deadline()).await
            };

            let e = match result {
                Ok(()) => {
                    self.mark_delivered(&delivery.key, delivery.generation);
                    return;
                }
                Err(e) => e,
            };

            failed_attempts += 1;
            match self.options.retry_policy.next_delay(failed_attempts) {
                Some(delay) => {
                    slog::warn!(
                        self.logger,
                        "Write for '{}' failed (attempt {}), retrying in {:?}: {}",
                        delivery.key,
                        failed_attempts,
                        delay,
                        e
                    );
                    tokio::select! {
                        _ = delivery.token.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    slog::error!(
                        self.logger,
                        "Write for '{}' failed after {} attempts, leaving it for recovery: {}",
                        delivery.key,
                        failed_attempts,
                        e
                    );
                    self.mark_abandoned(&delivery.key, delivery.generation);
                    return;
                }
            }
        }
    }

    fn mark_delivered(&self, key: &str, generation: u64) {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get_mut(key) {
            if entry.pending.as_ref().map_or(false, |p| p.generation == generation) {
                entry.pending = None;
            }
        }
    }

    fn mark_abandoned(&self, key: &str, generation: u64) {
        let mut entries = self.lock_entries();
        if let Some(Entry {
            pending: Some(pending), ..
        }) = entries.get_mut(key)
        {
            if pending.generation == generation {
                pending.retrying = false;
            }
        }
    }

    async fn flush_pending(&self) {
        let abandoned: Vec<(String, u64)> = self
            .lock_entries()
            .iter()
            .filter_map(|(key, entry)| match &entry.pending {
                Some(pending) if !pending.retrying => Some((key.clone(), pending.generation)),
                _ => None,
            })
            .collect();
        if abandoned.is_empty() {
            return;
        }

        slog::info!(self.logger, "Re-executing {} undelivered writes", abandoned.len());
        let deliveries = abandoned
            .into_iter()
            .filter_map(|(key, generation)| self.reregister(&key, generation))
            .map(|delivery| self.deliver(delivery));
        future::join_all(deliveries).await;
    }

    async fn recover(self: Arc<Self>) {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            slog::debug!(self.logger, "Write in flight, skipping recovery tick");
            return;
        }
        self.flush_pending().await;
    }

    async fn renew_all(self: Arc<Self>) {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            slog::debug!(self.logger, "Write in flight, skipping renewal tick");
            return;
        }

        let lanes: Vec<(String, Arc<tokio::sync::Mutex<()>>)> = self
            .lock_entries()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.lane.clone()))
            .collect();

        future::join_all(lanes.into_iter().map(|(key, lane)| {
            let inner = self.clone();
            async move {
                let _lane = lane.lock().await;
                // The key may have been forgotten or rewritten while waiting on its lane.
                let current = match inner.lock_entries().get(&key) {
                    Some(entry) => entry.current.clone(),
                    None => return,
                };
                if let Err(e) = current(inner.options.lease_deadline()).await {
                    slog::warn!(inner.logger, "Lease renewal for '{}' failed: {}", key, e);
                }
            }
        }))
        .await;
    }
}

/// Runs `tick` every `period` until the replicator shuts down or is dropped. The first tick
/// happens one period after start.
async fn run_periodically<F, Fut>(weak_inner: Weak<Inner>, period: Duration, tick: F)
where
    F: Fn(Arc<Inner>) -> Fut,
    Fut: Future<Output = ()>,
{
    let shutdown = match weak_inner.upgrade() {
        Some(inner) => inner.shutdown.clone(),
        None => return,
    };
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = interval.tick() => {}
        }

        let inner = match weak_inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tick(inner) => {}
        }
    }
}

/// Counts one write attempt as in flight for as long as it lives.
struct InFlight<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        InFlight { counter }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicator::{FixedBackoff, NoRetry};
    use std::sync::atomic::AtomicBool;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn quiet_options() -> ReplicatorOptions {
        // Background loops stay out of the way unless a test shortens them.
        ReplicatorOptions {
            renewal_period: Some(Duration::from_secs(3600)),
            expiration_period: Some(Duration::from_secs(7200)),
            recover_period: Some(Duration::from_secs(3600)),
            retry_policy: Some(Arc::new(NoRetry)),
        }
    }

    fn recording_action(log: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> ReplicationAction {
        let log = log.clone();
        replication_action(move |_| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(name);
                Ok(())
            }
        })
    }

    /// Fails until `healthy` is set, counting every invocation.
    fn flaky_action(healthy: &Arc<AtomicBool>, calls: &Arc<AtomicUsize>) -> ReplicationAction {
        let healthy = healthy.clone();
        let calls = calls.clone();
        replication_action(move |_| {
            let healthy = healthy.load(Ordering::SeqCst);
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if healthy {
                    Ok(())
                } else {
                    Err(StoreError::Disconnected {
                        peer: "test".to_string(),
                    })
                }
            }
        })
    }

    #[tokio::test]
    async fn successful_write_is_no_longer_pending() {
        let replicator = ResilientReplicator::new(test_logger(), quiet_options()).unwrap();
        let log = Arc::new(Mutex::new(vec![]));

        replicator.execute("k", recording_action(&log, "a1")).await;

        assert_eq!(*log.lock().unwrap(), vec!["a1"]);
        assert!(!replicator.is_pending("k"));
    }

    #[tokio::test]
    async fn failed_write_stays_pending_until_flushed() {
        // -- setup --
        let replicator = ResilientReplicator::new(test_logger(), quiet_options()).unwrap();
        let healthy = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        // -- execute --
        replicator.execute("k", flaky_action(&healthy, &calls)).await;

        // -- verify --
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(replicator.is_pending("k"));

        healthy.store(true, Ordering::SeqCst);
        replicator.flush_pending().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!replicator.is_pending("k"));

        // Nothing left to flush.
        replicator.flush_pending().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rapid_writes_only_deliver_the_latest() {
        let replicator = ResilientReplicator::new(test_logger(), quiet_options()).unwrap();
        let log = Arc::new(Mutex::new(vec![]));

        let first = replicator.spawn_execute("k", recording_action(&log, "a1"));
        replicator.execute("k", recording_action(&log, "a2")).await;
        first.await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["a2"]);
        assert!(!replicator.is_pending("k"));
    }

    #[tokio::test]
    async fn superseded_retry_loop_stops() {
        // -- setup --
        let options = ReplicatorOptions {
            retry_policy: Some(Arc::new(FixedBackoff::forever(Duration::from_millis(10)))),
            ..quiet_options()
        };
        let replicator = ResilientReplicator::new(test_logger(), options).unwrap();
        let healthy = Arc::new(AtomicBool::new(false));
        let failing_calls = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(vec![]));

        // -- execute --
        let retrying = replicator.spawn_execute("k", flaky_action(&healthy, &failing_calls));
        tokio::time::sleep(Duration::from_millis(35)).await;
        replicator.execute("k", recording_action(&log, "replacement")).await;

        // -- verify --
        tokio::time::timeout(Duration::from_secs(5), retrying)
            .await
            .expect("Superseded retry loop kept running")
            .unwrap();
        let calls_after_supersede = failing_calls.load(Ordering::SeqCst);
        assert!(calls_after_supersede >= 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(failing_calls.load(Ordering::SeqCst), calls_after_supersede);
        assert_eq!(*log.lock().unwrap(), vec!["replacement"]);
        assert!(!replicator.is_pending("k"));
    }

    #[tokio::test]
    async fn limited_retries_give_up_quietly() {
        let options = ReplicatorOptions {
            retry_policy: Some(Arc::new(FixedBackoff::limited(Duration::from_millis(1), 3))),
            ..quiet_options()
        };
        let replicator = ResilientReplicator::new(test_logger(), options).unwrap();
        let healthy = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        replicator.execute("k", flaky_action(&healthy, &calls)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(replicator.is_pending("k"));
    }

    #[tokio::test]
    async fn renewal_reinvokes_latest_write_with_fresh_lease() {
        // -- setup --
        let options = ReplicatorOptions {
            renewal_period: Some(Duration::from_millis(50)),
            expiration_period: Some(Duration::from_millis(100)),
            recover_period: Some(Duration::from_millis(150)),
            retry_policy: Some(Arc::new(NoRetry)),
        };
        let replicator = ResilientReplicator::new(test_logger(), options).unwrap();
        let leases = Arc::new(Mutex::new(vec![]));

        // -- execute --
        let action = {
            let leases = leases.clone();
            replication_action(move |valid_until| {
                leases.lock().unwrap().push(valid_until);
                async { Ok(()) }
            })
        };
        replicator.execute("k", action).await;
        tokio::time::sleep(Duration::from_millis(230)).await;
        replicator.shutdown().await;

        // -- verify --
        let leases = leases.lock().unwrap().clone();
        assert!(leases.len() >= 3, "Expected renewals, got {} writes", leases.len());
        assert!(leases.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[tokio::test]
    async fn recovery_loop_redelivers_abandoned_write() {
        // -- setup --
        let options = ReplicatorOptions {
            recover_period: Some(Duration::from_millis(50)),
            ..quiet_options()
        };
        let replicator = ResilientReplicator::new(test_logger(), options).unwrap();
        let healthy = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        replicator.execute("k", flaky_action(&healthy, &calls)).await;
        assert!(replicator.is_pending("k"));

        // -- execute --
        healthy.store(true, Ordering::SeqCst);

        // -- verify --
        tokio::time::timeout(Duration::from_secs(5), async {
            while replicator.is_pending("k") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Recovery loop never delivered the write");
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn renewal_waits_for_write_in_flight() {
        // -- setup --
        let options = ReplicatorOptions {
            renewal_period: Some(Duration::from_millis(30)),
            expiration_period: Some(Duration::from_secs(60)),
            ..quiet_options()
        };
        let replicator = ResilientReplicator::new(test_logger(), options).unwrap();
        let renewed_calls = Arc::new(AtomicUsize::new(0));
        let renewed = {
            let renewed_calls = renewed_calls.clone();
            replication_action(move |_| {
                renewed_calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
        };
        replicator.execute("renewed", renewed).await;

        let entered = Arc::new(AtomicBool::new(false));
        let released = Arc::new(AtomicBool::new(false));
        let stuck = {
            let entered = entered.clone();
            let released = released.clone();
            replication_action(move |_| {
                entered.store(true, Ordering::SeqCst);
                let released = released.clone();
                async move {
                    while !released.load(Ordering::SeqCst) {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Ok(())
                }
            })
        };

        // -- execute --
        let in_flight = replicator.spawn_execute("stuck", stuck);
        while !entered.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        let calls_while_stuck = renewed_calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(150)).await;

        // -- verify --
        assert_eq!(renewed_calls.load(Ordering::SeqCst), calls_while_stuck);

        released.store(true, Ordering::SeqCst);
        in_flight.await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while renewed_calls.load(Ordering::SeqCst) <= calls_while_stuck {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Renewal never resumed");
    }

    #[tokio::test]
    async fn forget_stops_delivery_and_renewal() {
        let options = ReplicatorOptions {
            retry_policy: Some(Arc::new(FixedBackoff::forever(Duration::from_millis(10)))),
            ..quiet_options()
        };
        let replicator = ResilientReplicator::new(test_logger(), options).unwrap();
        let healthy = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let retrying = replicator.spawn_execute("k", flaky_action(&healthy, &calls));
        tokio::time::sleep(Duration::from_millis(15)).await;
        replicator.forget("k");

        tokio::time::timeout(Duration::from_secs(5), retrying)
            .await
            .expect("Forgotten key kept retrying")
            .unwrap();
        assert!(!replicator.is_pending("k"));
    }

    #[tokio::test]
    async fn shutdown_cancels_pending_deliveries() {
        let options = ReplicatorOptions {
            retry_policy: Some(Arc::new(FixedBackoff::forever(Duration::from_millis(10)))),
            ..quiet_options()
        };
        let replicator = ResilientReplicator::new(test_logger(), options).unwrap();
        let healthy = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let retrying = replicator.spawn_execute("k", flaky_action(&healthy, &calls));
        replicator.shutdown().await;

        tokio::time::timeout(Duration::from_secs(5), retrying)
            .await
            .expect("Delivery survived shutdown")
            .unwrap();
        assert!(replicator.is_shut_down());
    }
}
