use crate::consensus::{self, InstancePeerStatus};
use crate::gate::LockGate;
use crate::redis_store::encoding::{self, FIELD_DELIMITER};
use crate::redis_store::HashChannel;
use crate::replicator::{replication_action, ReplicatorOptions, ReplicatorOptionsError, ResilientReplicator};
use crate::store::{LockStatusStore, StoreError};
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

pub struct RedisStoreConfig {
    pub logger: slog::Logger,
    /// Name of this process's instance, for log context.
    pub instance_name: String,
    pub lock_key: String,
    pub replicator: ReplicatorOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum RedisStoreError {
    #[error("lock key must not be empty")]
    EmptyLockKey,
    #[error("invalid replicator options")]
    Options(#[from] ReplicatorOptionsError),
    #[error("redis error")]
    Redis(#[from] redis::RedisError),
}

/// RedisStore shares the statuses of one lock key through a Redis hash, one field per instance.
///
/// Every write also publishes the new value, and every store subscribed to the lock key then
/// re-reads the whole hash and drives its local gate from it.
pub struct RedisStore {
    logger: slog::Logger,
    backend: Arc<dyn HashChannel>,
    hash_key: String,
    channel: String,
    replicator: ResilientReplicator,
    shutdown: CancellationToken,
    subscriber: Mutex<Option<JoinHandle<()>>>,
}

impl RedisStore {
    /// Subscribes to the lock key's notifications, syncs `gate` with the current hash, and
    /// keeps it in sync until shutdown.
    pub async fn start(
        config: RedisStoreConfig,
        backend: Arc<dyn HashChannel>,
        gate: Arc<LockGate>,
    ) -> Result<Self, RedisStoreError> {
        if config.lock_key.trim().is_empty() {
            return Err(RedisStoreError::EmptyLockKey);
        }

        let logger = config.logger.new(slog::o!(
            "LockKey" => config.lock_key.clone(),
            "Instance" => config.instance_name.clone(),
        ));
        let replicator = ResilientReplicator::new(logger.clone(), config.replicator)?;
        let hash_key = encoding::hash_key(&config.lock_key);
        let channel = encoding::channel_name(&config.lock_key);

        let notifications = backend.subscribe(&channel).await?;
        let mut subscriber = Subscriber {
            logger: logger.clone(),
            backend: backend.clone(),
            hash_key: hash_key.clone(),
            channel: channel.clone(),
            gate,
            statuses: Vec::new(),
        };
        let next_expiry = subscriber.refresh().await?;

        let shutdown = CancellationToken::new();
        let task = tokio::task::spawn(subscriber.run(notifications, next_expiry, shutdown.clone()));
        slog::info!(logger, "Redis store started.");

        Ok(RedisStore {
            logger,
            backend,
            hash_key,
            channel,
            replicator,
            shutdown,
            subscriber: Mutex::new(Some(task)),
        })
    }

    /// Stops the subscription and the replication loops. Statuses already written stay in the
    /// hash until their lease lapses.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.replicator.shutdown().await;

        let task = self
            .subscriber
            .lock()
            .expect("RedisStore subscriber mutex guard poison")
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        slog::info!(self.logger, "Redis store shut down.");
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait::async_trait]
impl LockStatusStore for RedisStore {
    async fn set_status(&self, instance_name: &str, is_busy: bool, lock_data: Option<&str>) -> Result<(), StoreError> {
        if self.replicator.is_shut_down() {
            return Err(StoreError::ShutDown);
        }
        consensus::validate_lock_data(lock_data, &[FIELD_DELIMITER])?;

        let backend = self.backend.clone();
        let hash_key = self.hash_key.clone();
        let channel = self.channel.clone();
        let field = instance_name.to_string();
        let lock_data = lock_data.map(String::from);
        let action = replication_action(move |valid_until| {
            let backend = backend.clone();
            let hash_key = hash_key.clone();
            let channel = channel.clone();
            let field = field.clone();
            let value = encoding::encode_status(is_busy, lock_data.as_deref(), Some(valid_until));
            async move {
                backend
                    .write_and_publish(&hash_key, &field, &channel, &value)
                    .await
                    .map_err(StoreError::from)
            }
        });

        slog::debug!(self.logger, "Replicating status. Busy: {}", is_busy);
        self.replicator.spawn_execute(instance_name, action);
        Ok(())
    }
}

struct Subscriber {
    logger: slog::Logger,
    backend: Arc<dyn HashChannel>,
    hash_key: String,
    channel: String,
    gate: Arc<LockGate>,
    // Last statuses read from the hash.
    statuses: Vec<InstancePeerStatus>,
}

impl Subscriber {
    async fn run(
        mut self,
        mut notifications: BoxStream<'static, String>,
        mut next_expiry: Option<DateTime<Utc>>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                notification = notifications.next() => {
                    if notification.is_none() {
                        slog::warn!(self.logger, "Subscription ended, resubscribing.");
                        notifications = match self.resubscribe(&mut next_expiry, &shutdown).await {
                            Some(notifications) => notifications,
                            None => return,
                        };
                    }
                }
                _ = consensus::expiry_timer(next_expiry) => {}
            }

            next_expiry = self.sync().await;
        }
    }

    /// Re-reads every status of the lock key and drives the gate. Returns when the verdict
    /// may next change on its own.
    async fn refresh(&mut self) -> redis::RedisResult<Option<DateTime<Utc>>> {
        let fields = self.backend.read_all(&self.hash_key).await?;
        self.statuses = fields
            .iter()
            .map(|(instance_id, value)| encoding::decode_status(instance_id, value))
            .collect();
        Ok(self.evaluate())
    }

    /// Like `refresh`, but falls back to the last statuses read when Redis is unreachable, so
    /// their leases still lapse.
    async fn sync(&mut self) -> Option<DateTime<Utc>> {
        match self.refresh().await {
            Ok(next_expiry) => next_expiry,
            Err(e) => {
                slog::warn!(self.logger, "Reading statuses failed: {}", e);
                let retry_at = Utc::now() + chrono::Duration::seconds(1);
                let next_expiry = self.evaluate();
                Some(next_expiry.map_or(retry_at, |expiry| expiry.min(retry_at)))
            }
        }
    }

    fn evaluate(&self) -> Option<DateTime<Utc>> {
        let verdict = consensus::are_all_idle(&self.statuses, Utc::now());
        consensus::drive_gate(&self.gate, &verdict);
        verdict.next_expiry
    }

    async fn resubscribe(
        &mut self,
        next_expiry: &mut Option<DateTime<Utc>>,
        shutdown: &CancellationToken,
    ) -> Option<BoxStream<'static, String>> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = consensus::expiry_timer(*next_expiry) => {
                    *next_expiry = self.sync().await;
                    continue;
                }
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
            match self.backend.subscribe(&self.channel).await {
                Ok(notifications) => return Some(notifications),
                Err(e) => slog::warn!(self.logger, "Resubscribing failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis_store::InMemoryHashChannel;
    use crate::replicator::FixedBackoff;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn config(instance_name: &str) -> RedisStoreConfig {
        RedisStoreConfig {
            logger: test_logger(),
            instance_name: instance_name.to_string(),
            lock_key: "payments".to_string(),
            replicator: ReplicatorOptions {
                retry_policy: Some(Arc::new(FixedBackoff::forever(Duration::from_millis(10)))),
                ..Default::default()
            },
        }
    }

    async fn start(backend: &Arc<InMemoryHashChannel>, instance_name: &str) -> (RedisStore, Arc<LockGate>) {
        let gate = Arc::new(LockGate::new(test_logger()));
        let store = RedisStore::start(config(instance_name), backend.clone(), gate.clone())
            .await
            .unwrap();
        (store, gate)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("Condition never became true");
    }

    #[tokio::test]
    async fn busy_instance_blocks_every_subscriber() {
        // -- setup --
        let backend = Arc::new(InMemoryHashChannel::new());
        let (store_a, gate_a) = start(&backend, "a").await;
        let (_store_b, gate_b) = start(&backend, "b").await;

        // -- execute --
        store_a.set_status("a", true, Some("overload")).await.unwrap();

        // -- verify --
        wait_until(|| gate_b.is_blocked()).await;
        assert_eq!(gate_b.lock_data(), Some("overload".to_string()));
        wait_until(|| gate_a.is_blocked()).await;

        store_a.set_status("a", false, None).await.unwrap();
        wait_until(|| !gate_b.is_blocked()).await;
        wait_until(|| !gate_a.is_blocked()).await;

        let value = backend
            .field(&encoding::hash_key("payments"), "a")
            .expect("Expected a hash field for instance a");
        assert!(value.starts_with("0;;"));
    }

    #[tokio::test]
    async fn start_syncs_with_existing_statuses() {
        let backend = Arc::new(InMemoryHashChannel::new());
        let value = encoding::encode_status(true, Some("warming"), None);
        backend
            .write_and_publish(
                &encoding::hash_key("payments"),
                "other",
                &encoding::channel_name("payments"),
                &value,
            )
            .await
            .unwrap();

        let (_store, gate) = start(&backend, "a").await;

        assert!(gate.is_blocked());
        assert_eq!(gate.lock_data(), Some("warming".to_string()));
    }

    #[tokio::test]
    async fn lapsed_lease_unblocks_without_notification() {
        // -- setup --
        let backend = Arc::new(InMemoryHashChannel::new());
        let (_store, gate) = start(&backend, "a").await;

        // -- execute --
        // A crashed instance's last write: busy, with a lease nobody renews.
        let value = encoding::encode_status(
            true,
            Some("crashed"),
            Some(Utc::now() + chrono::Duration::milliseconds(100)),
        );
        backend
            .write_and_publish(
                &encoding::hash_key("payments"),
                "crashed",
                &encoding::channel_name("payments"),
                &value,
            )
            .await
            .unwrap();

        // -- verify --
        wait_until(|| gate.is_blocked()).await;
        wait_until(|| !gate.is_blocked()).await;
    }

    #[tokio::test]
    async fn writes_survive_backend_outage() {
        let backend = Arc::new(InMemoryHashChannel::new());
        let (store_a, _gate_a) = start(&backend, "a").await;
        let (_store_b, gate_b) = start(&backend, "b").await;

        backend.set_unavailable(true);
        store_a.set_status("a", true, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!gate_b.is_blocked());

        backend.set_unavailable(false);
        wait_until(|| gate_b.is_blocked()).await;
    }

    #[tokio::test]
    async fn lapsed_lease_unblocks_while_redis_is_unreachable() {
        // -- setup --
        let backend = Arc::new(InMemoryHashChannel::new());
        let (_store, gate) = start(&backend, "a").await;
        let value = encoding::encode_status(
            true,
            Some("crashed"),
            Some(Utc::now() + chrono::Duration::milliseconds(200)),
        );
        backend
            .write_and_publish(
                &encoding::hash_key("payments"),
                "crashed",
                &encoding::channel_name("payments"),
                &value,
            )
            .await
            .unwrap();
        wait_until(|| gate.is_blocked()).await;

        // -- execute --
        backend.set_unavailable(true);

        // -- verify --
        wait_until(|| !gate.is_blocked()).await;
    }

    #[tokio::test]
    async fn rejects_ambiguous_lock_data() {
        let backend = Arc::new(InMemoryHashChannel::new());
        let (store, _gate) = start(&backend, "a").await;

        assert!(matches!(
            store.set_status("a", true, Some("a;b")).await,
            Err(StoreError::InvalidLockData { .. })
        ));
    }

    #[tokio::test]
    async fn set_status_after_shutdown_fails() {
        let backend = Arc::new(InMemoryHashChannel::new());
        let (store, _gate) = start(&backend, "a").await;

        store.shutdown().await;

        assert!(matches!(
            store.set_status("a", true, None).await,
            Err(StoreError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn start_rejects_empty_lock_key() {
        let backend = Arc::new(InMemoryHashChannel::new());
        let gate = Arc::new(LockGate::new(test_logger()));
        let mut config = config("a");
        config.lock_key = String::new();

        assert!(matches!(
            RedisStore::start(config, backend, gate).await,
            Err(RedisStoreError::EmptyLockKey)
        ));
    }
}
