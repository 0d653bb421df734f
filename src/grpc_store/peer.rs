use crate::grpc::reactive_lock_grpc_client::ReactiveLockGrpcClient;
use crate::grpc::LockStatusRequest;
use crate::grpc_store::store::Shared;
use crate::store::StoreError;
use rand::Rng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;

const OUTBOUND_CAPACITY: usize = 32;

/// One peer server and the status stream this instance keeps open to it.
pub(crate) struct PeerLink {
    pub index: usize,
    pub url: String,
    endpoint: Endpoint,
    // `Some` while a stream is open.
    outbound: Mutex<Option<mpsc::Sender<LockStatusRequest>>>,
    registered: AtomicBool,
    replication_keys: Mutex<HashSet<String>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerLink {
    pub fn new(index: usize, url: String, endpoint: Endpoint, cancel: CancellationToken) -> Self {
        PeerLink {
            index,
            url,
            endpoint,
            outbound: Mutex::new(None),
            registered: AtomicBool::new(false),
            replication_keys: Mutex::new(HashSet::new()),
            cancel,
            task: Mutex::new(None),
        }
    }

    pub fn spawn(self: &Arc<Self>, shared: Arc<Shared>) {
        let task = tokio::task::spawn(run(shared, self.clone()));
        *self.task.lock().expect("PeerLink task mutex guard poison") = Some(task);
    }

    /// Replication key of `instance_name`'s writes to this peer.
    pub fn replication_key(&self, instance_name: &str) -> String {
        let key = format!("{}-{}", self.index, instance_name);
        self.replication_keys
            .lock()
            .expect("PeerLink replication keys mutex guard poison")
            .insert(key.clone());
        key
    }

    pub fn take_replication_keys(&self) -> Vec<String> {
        self.replication_keys
            .lock()
            .expect("PeerLink replication keys mutex guard poison")
            .drain()
            .collect()
    }

    /// Queues `request` on the open stream. Fails if no stream is open.
    pub async fn send(&self, request: LockStatusRequest) -> Result<(), StoreError> {
        let sender = self.lock_outbound().clone();
        let disconnected = || StoreError::Disconnected { peer: self.url.clone() };
        match sender {
            Some(sender) => sender.send(request).await.map_err(|_| disconnected()),
            None => Err(disconnected()),
        }
    }

    /// Stops the stream and waits for its task to exit.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().expect("PeerLink task mutex guard poison").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn set_outbound(&self, sender: Option<mpsc::Sender<LockStatusRequest>>) {
        *self.lock_outbound() = sender;
    }

    fn lock_outbound(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<LockStatusRequest>>> {
        self.outbound.lock().expect("PeerLink outbound mutex guard poison")
    }
}

/// Keeps a status stream open to the peer until the link is cancelled, reconnecting after
/// every failure.
async fn run(shared: Arc<Shared>, link: Arc<PeerLink>) {
    let logger = shared.logger.new(slog::o!("Peer" => link.url.clone()));

    loop {
        let result = tokio::select! {
            _ = link.cancel.cancelled() => break,
            result = session(&shared, &link, &logger) => result,
        };
        link.set_outbound(None);
        match result {
            Ok(()) => slog::info!(logger, "Status stream closed by peer."),
            Err(e) => slog::warn!(logger, "Status stream failed: {}", e),
        }

        let delay = jittered(shared.reconnect_delay);
        tokio::select! {
            _ = link.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    link.set_outbound(None);
    slog::debug!(logger, "Peer link stopped.");
}

async fn session(shared: &Shared, link: &PeerLink, logger: &slog::Logger) -> Result<(), StoreError> {
    let channel = link.endpoint.connect().await?;
    let mut client = ReactiveLockGrpcClient::new(channel);

    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    // The first message registers this instance and selects the lock key.
    tx.send(shared.registration())
        .await
        .map_err(|_| StoreError::Disconnected { peer: link.url.clone() })?;
    let mut inbound = client
        .subscribe_lock_status(ReceiverStream::new(rx))
        .await?
        .into_inner();

    link.set_outbound(Some(tx));
    if !link.registered.swap(true, Ordering::SeqCst) {
        shared.mark_peer_ready();
    }
    slog::info!(logger, "Status stream open.");

    while let Some(notification) = inbound.message().await? {
        shared.apply_snapshot(link.index, &notification);
    }
    Ok(())
}

fn jittered(delay: Duration) -> Duration {
    rand::thread_rng().gen_range(delay..=delay + delay / 4)
}
