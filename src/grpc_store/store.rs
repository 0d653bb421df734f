use crate::consensus::{self, InstancePeerStatus};
use crate::gate::LockGate;
use crate::grpc::{LockStatusNotification, LockStatusRequest};
use crate::grpc_store::convert;
use crate::grpc_store::peer::PeerLink;
use crate::replicator::{replication_action, ReplicatorOptions, ReplicatorOptionsError, ResilientReplicator};
use crate::store::{LockStatusStore, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tonic::codegen::http::uri;
use tonic::transport::Endpoint;

pub struct RpcStoreConfig {
    pub logger: slog::Logger,
    pub instance_name: String,
    pub lock_key: String,
    pub main_server: String,
    pub replica_servers: Vec<String>,
    /// Pause before reopening a failed status stream, plus up to a quarter of it as jitter.
    /// Default 1s.
    pub reconnect_delay: Option<Duration>,
    pub replicator: ReplicatorOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcStoreCreationError {
    #[error("instance name must not be empty")]
    EmptyInstanceName,
    #[error("lock key must not be empty")]
    EmptyLockKey,
    #[error("invalid server url '{url}'")]
    InvalidUri {
        url: String,
        #[source]
        source: uri::InvalidUri,
    },
    #[error("invalid replicator options")]
    Options(#[from] ReplicatorOptionsError),
}

/// RpcStore shares the statuses of one lock key through one or more lock status servers.
///
/// A status stream stays open to every server. Status changes are written to all of them, and
/// the snapshots they push back are merged to drive the local gate.
pub struct RpcStore {
    shared: Arc<Shared>,
    peers: Mutex<Vec<Arc<PeerLink>>>,
    shutdown: CancellationToken,
    expected_ready: usize,
    ready: watch::Receiver<usize>,
}

pub(crate) struct Shared {
    pub logger: slog::Logger,
    pub reconnect_delay: Duration,
    lock_key: String,
    instance_name: String,
    gate: Arc<LockGate>,
    replicator: ResilientReplicator,
    // Latest snapshot from each peer, by peer index.
    views: Mutex<HashMap<usize, HashMap<String, InstancePeerStatus>>>,
    last_status: Mutex<Option<LastStatus>>,
    ready: watch::Sender<usize>,
    // Earliest lease that may flip the verdict of the merged view.
    next_expiry: watch::Sender<Option<DateTime<Utc>>>,
}

#[derive(Clone)]
struct LastStatus {
    instance_name: String,
    is_busy: bool,
    lock_data: Option<String>,
}

impl RpcStore {
    /// Opens a status stream to every server. Streams that cannot be opened yet are retried in
    /// the background; `ready()` tells when all of them registered once.
    pub fn start(config: RpcStoreConfig, gate: Arc<LockGate>) -> Result<Self, RpcStoreCreationError> {
        if config.instance_name.trim().is_empty() {
            return Err(RpcStoreCreationError::EmptyInstanceName);
        }
        if config.lock_key.trim().is_empty() {
            return Err(RpcStoreCreationError::EmptyLockKey);
        }

        let urls: Vec<String> = std::iter::once(config.main_server)
            .chain(config.replica_servers.into_iter())
            .collect();
        let mut endpoints = Vec::with_capacity(urls.len());
        for url in urls {
            let endpoint = Endpoint::from_shared(url.clone())
                .map_err(|source| RpcStoreCreationError::InvalidUri { url: url.clone(), source })?;
            endpoints.push((url, endpoint));
        }

        let logger = config.logger.new(slog::o!(
            "LockKey" => config.lock_key.clone(),
            "Instance" => config.instance_name.clone(),
        ));
        let replicator = ResilientReplicator::new(logger.clone(), config.replicator)?;
        let (ready_tx, ready_rx) = watch::channel(0);
        let (expiry_tx, expiry_rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            logger,
            reconnect_delay: config.reconnect_delay.unwrap_or(Duration::from_secs(1)),
            lock_key: config.lock_key,
            instance_name: config.instance_name,
            gate,
            replicator,
            views: Mutex::new(HashMap::new()),
            last_status: Mutex::new(None),
            ready: ready_tx,
            next_expiry: expiry_tx,
        });

        let shutdown = CancellationToken::new();
        tokio::task::spawn(reevaluate_on_expiry(
            Arc::downgrade(&shared),
            expiry_rx,
            shutdown.clone(),
        ));
        let expected_ready = endpoints.len();
        let peers: Vec<Arc<PeerLink>> = endpoints
            .into_iter()
            .enumerate()
            .map(|(index, (url, endpoint))| {
                let link = Arc::new(PeerLink::new(index, url, endpoint, shutdown.child_token()));
                link.spawn(shared.clone());
                link
            })
            .collect();

        slog::info!(shared.logger, "Rpc store started with {} peer servers.", peers.len());
        Ok(RpcStore {
            shared,
            peers: Mutex::new(peers),
            shutdown,
            expected_ready,
            ready: ready_rx,
        })
    }

    /// Resolves once every server the store started with has accepted a registration.
    pub async fn ready(&self) {
        let mut ready = self.ready.clone();
        while *ready.borrow_and_update() < self.expected_ready {
            if ready.changed().await.is_err() {
                return;
            }
        }
    }

    /// Closes the stream to the server at `url` and forgets everything written to or received
    /// from it. Returns false if no such server is known.
    pub async fn remove_peer(&self, url: &str) -> bool {
        let link = {
            let mut peers = self.lock_peers();
            match peers.iter().position(|link| link.url == url) {
                Some(position) => peers.remove(position),
                None => return false,
            }
        };

        link.close().await;
        for key in link.take_replication_keys() {
            self.shared.replicator.forget(&key);
        }
        self.shared.lock_views().remove(&link.index);
        self.shared.reevaluate();

        slog::info!(self.shared.logger, "Removed peer server '{}'", url);
        true
    }

    pub fn peer_urls(&self) -> Vec<String> {
        self.lock_peers().iter().map(|link| link.url.clone()).collect()
    }

    /// Closes every stream and stops replicating. Statuses already written stay on the
    /// servers until their lease lapses.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let peers: Vec<Arc<PeerLink>> = self.lock_peers().clone();
        futures::future::join_all(peers.iter().map(|link| link.close())).await;
        self.shared.replicator.shutdown().await;
        slog::info!(self.shared.logger, "Rpc store shut down.");
    }

    fn lock_peers(&self) -> std::sync::MutexGuard<'_, Vec<Arc<PeerLink>>> {
        self.peers.lock().expect("RpcStore peers mutex guard poison")
    }
}

impl Drop for RpcStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait::async_trait]
impl LockStatusStore for RpcStore {
    async fn set_status(&self, instance_name: &str, is_busy: bool, lock_data: Option<&str>) -> Result<(), StoreError> {
        if self.shared.replicator.is_shut_down() {
            return Err(StoreError::ShutDown);
        }
        consensus::validate_lock_data(lock_data, &[])?;

        let status = LastStatus {
            instance_name: instance_name.to_string(),
            is_busy,
            lock_data: lock_data.map(String::from),
        };
        *self.shared.lock_last_status() = Some(status.clone());

        let peers: Vec<Arc<PeerLink>> = self.lock_peers().clone();
        for link in peers {
            let key = link.replication_key(instance_name);
            let request = self.shared.request(&status, None);
            let action = replication_action(move |valid_until| {
                let link = link.clone();
                let mut request = request.clone();
                request.valid_until_millis = convert::millis_from_timestamp(Some(valid_until));
                async move { link.send(request).await }
            });
            self.shared.replicator.spawn_execute(&key, action);
        }

        slog::debug!(self.shared.logger, "Replicating status. Busy: {}", is_busy);
        Ok(())
    }
}

impl Shared {
    fn request(&self, status: &LastStatus, valid_until: Option<DateTime<Utc>>) -> LockStatusRequest {
        LockStatusRequest {
            lock_key: self.lock_key.clone(),
            instance_id: status.instance_name.clone(),
            is_busy: status.is_busy,
            lock_data: status.lock_data.clone().unwrap_or_default(),
            valid_until_millis: convert::millis_from_timestamp(valid_until),
        }
    }

    /// First message of a stream: the last status this instance set, idle if none, with a
    /// fresh lease.
    pub fn registration(&self) -> LockStatusRequest {
        let status = self.lock_last_status().clone().unwrap_or_else(|| LastStatus {
            instance_name: self.instance_name.clone(),
            is_busy: false,
            lock_data: None,
        });
        self.request(&status, Some(self.replicator.lease_deadline()))
    }

    pub fn mark_peer_ready(&self) {
        self.ready.send_modify(|count| *count += 1);
    }

    /// Stores a peer's snapshot, then drives the gate from the merged view. Returns when the
    /// verdict may next change on its own.
    pub fn apply_snapshot(&self, peer_index: usize, notification: &LockStatusNotification) -> Option<DateTime<Utc>> {
        if notification.lock_key != self.lock_key {
            slog::warn!(
                self.logger,
                "Ignoring snapshot for lock key '{}'",
                notification.lock_key
            );
            return self.reevaluate();
        }

        let view = convert::peer_statuses(notification)
            .into_iter()
            .map(|status| (status.instance_id.clone(), status))
            .collect();
        self.lock_views().insert(peer_index, view);
        self.reevaluate()
    }

    pub fn reevaluate(&self) -> Option<DateTime<Utc>> {
        let merged = merge_views(&self.lock_views());
        let verdict = consensus::are_all_idle(&merged, Utc::now());
        consensus::drive_gate(&self.gate, &verdict);
        self.next_expiry.send_replace(verdict.next_expiry);
        verdict.next_expiry
    }

    fn lock_views(&self) -> std::sync::MutexGuard<'_, HashMap<usize, HashMap<String, InstancePeerStatus>>> {
        self.views.lock().expect("RpcStore views mutex guard poison")
    }

    fn lock_last_status(&self) -> std::sync::MutexGuard<'_, Option<LastStatus>> {
        self.last_status.lock().expect("RpcStore last status mutex guard poison")
    }
}

/// Re-evaluates the merged view whenever its earliest lease lapses. Runs for the store's whole
/// life, so leases keep expiring while every peer stream is down.
async fn reevaluate_on_expiry(
    weak_shared: Weak<Shared>,
    mut next_expiry: watch::Receiver<Option<DateTime<Utc>>>,
    shutdown: CancellationToken,
) {
    loop {
        let expiry = *next_expiry.borrow_and_update();
        tokio::select! {
            _ = shutdown.cancelled() => return,
            changed = next_expiry.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = consensus::expiry_timer(expiry) => {
                match weak_shared.upgrade() {
                    Some(shared) => {
                        shared.reevaluate();
                    }
                    None => return,
                }
            }
        }
    }
}

/// Merges the snapshots of every peer. When peers disagree about an instance, the status with
/// the latest lease wins, a status without lease being the latest of all.
fn merge_views(views: &HashMap<usize, HashMap<String, InstancePeerStatus>>) -> Vec<InstancePeerStatus> {
    fn lease_rank(status: &InstancePeerStatus) -> i64 {
        status.valid_until.map_or(i64::MAX, |t| t.timestamp_millis())
    }

    let mut merged: HashMap<&str, &InstancePeerStatus> = HashMap::new();
    for status in views.values().flat_map(|view| view.values()) {
        match merged.get(status.instance_id.as_str()) {
            Some(&existing) if lease_rank(existing) >= lease_rank(status) => {}
            _ => {
                merged.insert(&status.instance_id, status);
            }
        }
    }

    merged.into_iter().map(|(_, status)| status.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::InstanceLockStatus;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn config(main_server: &str) -> RpcStoreConfig {
        RpcStoreConfig {
            logger: test_logger(),
            instance_name: "a".to_string(),
            lock_key: "payments".to_string(),
            main_server: main_server.to_string(),
            replica_servers: vec![],
            reconnect_delay: Some(Duration::from_millis(50)),
            replicator: ReplicatorOptions::default(),
        }
    }

    fn status(id: &str, is_busy: bool, valid_until: Option<DateTime<Utc>>) -> InstancePeerStatus {
        InstancePeerStatus {
            instance_id: id.to_string(),
            is_busy,
            lock_data: None,
            valid_until,
        }
    }

    fn view(statuses: Vec<InstancePeerStatus>) -> HashMap<String, InstancePeerStatus> {
        statuses.into_iter().map(|s| (s.instance_id.clone(), s)).collect()
    }

    #[test]
    fn merge_prefers_latest_lease() {
        let now = Utc::now();
        let mut views = HashMap::new();
        views.insert(0, view(vec![status("a", true, Some(now + chrono::Duration::seconds(1)))]));
        views.insert(
            1,
            view(vec![
                status("a", false, Some(now + chrono::Duration::seconds(5))),
                status("b", true, None),
            ]),
        );

        let mut merged = merge_views(&views);
        merged.sort_by(|x, y| x.instance_id.cmp(&y.instance_id));

        assert_eq!(merged.len(), 2);
        assert!(!merged[0].is_busy);
        assert!(merged[1].is_busy);
    }

    #[test]
    fn merge_treats_missing_lease_as_latest() {
        let now = Utc::now();
        let mut views = HashMap::new();
        views.insert(0, view(vec![status("a", true, None)]));
        views.insert(1, view(vec![status("a", false, Some(now + chrono::Duration::seconds(5)))]));

        let merged = merge_views(&views);

        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_busy);
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let gate = Arc::new(LockGate::new(test_logger()));

        let mut empty_name = config("http://127.0.0.1:1");
        empty_name.instance_name = String::new();
        assert!(matches!(
            RpcStore::start(empty_name, gate.clone()),
            Err(RpcStoreCreationError::EmptyInstanceName)
        ));

        assert!(matches!(
            RpcStore::start(config("not a uri"), gate.clone()),
            Err(RpcStoreCreationError::InvalidUri { .. })
        ));

        let mut bad_options = config("http://127.0.0.1:1");
        bad_options.replicator.renewal_period = Some(Duration::from_secs(20));
        assert!(matches!(
            RpcStore::start(bad_options, gate),
            Err(RpcStoreCreationError::Options(_))
        ));
    }

    #[tokio::test]
    async fn snapshots_from_peers_drive_gate() {
        // -- setup --
        // Nothing listens on this port; the peer links keep retrying in the background.
        let gate = Arc::new(LockGate::new(test_logger()));
        let mut config = config("http://127.0.0.1:1");
        config.replica_servers = vec!["http://127.0.0.1:2".to_string()];
        let store = RpcStore::start(config, gate.clone()).unwrap();
        let lease = Utc::now() + chrono::Duration::seconds(30);

        let mut instances_status = HashMap::new();
        instances_status.insert(
            "b".to_string(),
            InstanceLockStatus {
                is_busy: true,
                lock_data: "overload".to_string(),
                valid_until_millis: lease.timestamp_millis(),
            },
        );
        let busy = LockStatusNotification {
            lock_key: "payments".to_string(),
            instances_status,
        };

        // -- execute & verify --
        let next_expiry = store.shared.apply_snapshot(1, &busy);
        assert!(gate.is_blocked());
        assert_eq!(gate.lock_data(), Some("overload".to_string()));
        assert_eq!(next_expiry.map(|t| t.timestamp_millis()), Some(lease.timestamp_millis()));

        // A snapshot for another lock key changes nothing.
        let other = LockStatusNotification {
            lock_key: "other".to_string(),
            instances_status: HashMap::new(),
        };
        store.shared.apply_snapshot(0, &other);
        assert!(gate.is_blocked());

        assert!(store.remove_peer("http://127.0.0.1:2").await);
        assert!(!gate.is_blocked());
        assert_eq!(store.peer_urls(), vec!["http://127.0.0.1:1".to_string()]);
        assert!(!store.remove_peer("http://127.0.0.1:2").await);

        store.shutdown().await;
    }

    #[tokio::test]
    async fn lapsed_lease_unblocks_while_peers_are_unreachable() {
        // -- setup --
        let gate = Arc::new(LockGate::new(test_logger()));
        let store = RpcStore::start(config("http://127.0.0.1:1"), gate.clone()).unwrap();

        let mut instances_status = HashMap::new();
        instances_status.insert(
            "b".to_string(),
            InstanceLockStatus {
                is_busy: true,
                lock_data: "overload".to_string(),
                valid_until_millis: (Utc::now() + chrono::Duration::milliseconds(200)).timestamp_millis(),
            },
        );
        let busy = LockStatusNotification {
            lock_key: "payments".to_string(),
            instances_status,
        };

        // -- execute --
        // The last snapshot before the stream broke; no other notification follows.
        store.shared.apply_snapshot(0, &busy);
        assert!(gate.is_blocked());

        // -- verify --
        tokio::time::timeout(Duration::from_secs(5), async {
            while gate.is_blocked() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Gate stayed blocked after the lease lapsed");

        store.shutdown().await;
    }

    #[tokio::test]
    async fn set_status_validates_and_remembers_registration() {
        let gate = Arc::new(LockGate::new(test_logger()));
        let store = RpcStore::start(config("http://127.0.0.1:1"), gate).unwrap();

        let registration = store.shared.registration();
        assert_eq!(registration.instance_id, "a");
        assert!(!registration.is_busy);
        assert!(registration.valid_until_millis > Utc::now().timestamp_millis());

        let merged = format!("x{}y", consensus::LOCK_DATA_SEPARATOR);
        assert!(matches!(
            store.set_status("a", true, Some(&merged)).await,
            Err(StoreError::InvalidLockData { .. })
        ));

        store.set_status("a", true, Some("overload")).await.unwrap();
        let registration = store.shared.registration();
        assert!(registration.is_busy);
        assert_eq!(registration.lock_data, "overload");
        assert_eq!(registration.lock_key, "payments");

        store.shutdown().await;
        assert!(matches!(
            store.set_status("a", false, None).await,
            Err(StoreError::ShutDown)
        ));
    }
}
