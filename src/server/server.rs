use crate::consensus::LOCK_DATA_SEPARATOR;
use crate::grpc::reactive_lock_grpc_server::{ReactiveLockGrpc, ReactiveLockGrpcServer};
use crate::grpc::{LockStatusNotification, LockStatusRequest, SetStatusReply};
use crate::server::options::{LockStatusServerOptions, LockStatusServerOptionsValidated};
use crate::server::status_table::StatusTable;
use crate::server::LockStatusServerShutdownSignal;
use chrono::Utc;
use std::convert::TryFrom;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

const OUTBOUND_CAPACITY: usize = 16;

/// LockStatusServer is the type that implements the lock status gRPC interface.
///
/// Instances sharing a lock key all stream their status to it, and it streams the lock key's
/// full status table back to each of them whenever that table changes.
pub struct LockStatusServer {
    logger: slog::Logger,
    table: Arc<StatusTable>,
    options: LockStatusServerOptionsValidated,
}

impl LockStatusServer {
    pub fn new(logger: slog::Logger, options: LockStatusServerOptions) -> Result<Self, &'static str> {
        Ok(LockStatusServer {
            logger,
            table: Arc::new(StatusTable::new()),
            options: LockStatusServerOptionsValidated::try_from(options)?,
        })
    }

    pub async fn run(
        self,
        socket_addr: SocketAddr,
        shutdown_signal: LockStatusServerShutdownSignal,
    ) -> Result<(), tonic::transport::Error> {
        let logger = self.logger.clone();
        slog::info!(logger, "Listening on '{:?}'", socket_addr);

        let stop_pruning = CancellationToken::new();
        let pruner = tokio::task::spawn(prune_periodically(
            logger.clone(),
            self.table.clone(),
            self.options.prune_period,
            self.options.expired_retention,
            stop_pruning.clone(),
        ));

        let result = Server::builder()
            .add_service(ReactiveLockGrpcServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown_signal)
            .await;

        stop_pruning.cancel();
        let _ = pruner.await;
        slog::info!(logger, "Server run() has exited: {:?}", result);
        result
    }

    fn validate_request(rpc_request: &LockStatusRequest) -> Result<(), Status> {
        if rpc_request.lock_key.is_empty() {
            return Err(Status::invalid_argument("LockKey must not be empty"));
        }
        if rpc_request.instance_id.is_empty() {
            return Err(Status::invalid_argument("InstanceId must not be empty"));
        }
        if rpc_request.lock_data.contains(LOCK_DATA_SEPARATOR) {
            return Err(Status::invalid_argument("LockData contains the lock data separator"));
        }
        Ok(())
    }

    /// Applies every request of one subscriber's inbound stream. The first request also starts
    /// forwarding snapshots of its lock key to `outbound`.
    async fn handle_subscription(
        logger: slog::Logger,
        table: Arc<StatusTable>,
        mut inbound: Streaming<LockStatusRequest>,
        outbound: mpsc::Sender<Result<LockStatusNotification, Status>>,
    ) {
        let registration = match inbound.message().await {
            Ok(Some(registration)) => registration,
            Ok(None) => return,
            Err(e) => {
                slog::debug!(logger, "Subscriber left before registering: {:?}", e);
                return;
            }
        };
        if let Err(status) = Self::validate_request(&registration) {
            let _ = outbound.send(Err(status)).await;
            return;
        }

        let lock_key = registration.lock_key.clone();
        let logger = logger.new(slog::o!(
            "LockKey" => lock_key.clone(),
            "Instance" => registration.instance_id.clone(),
        ));
        slog::info!(logger, "Subscriber registered.");

        table.upsert(registration);
        let forwarder = tokio::task::spawn(forward_snapshots(table.subscribe(&lock_key), outbound.clone()));

        loop {
            let rpc_request = match inbound.message().await {
                Ok(Some(rpc_request)) => rpc_request,
                Ok(None) => {
                    slog::info!(logger, "Subscriber closed its stream.");
                    break;
                }
                Err(e) => {
                    slog::info!(logger, "Subscriber stream failed: {:?}", e);
                    break;
                }
            };
            slog::debug!(logger, "ServerWire - {:?}", rpc_request);

            if let Err(status) = Self::validate_request(&rpc_request) {
                let _ = outbound.send(Err(status)).await;
                break;
            }
            if rpc_request.lock_key != lock_key {
                let _ = outbound
                    .send(Err(Status::invalid_argument("LockKey differs from the registered one")))
                    .await;
                break;
            }
            table.upsert(rpc_request);
        }

        forwarder.abort();
    }
}

/// Sends the current snapshot, then every later one, until the subscriber goes away.
async fn forward_snapshots(
    mut snapshots: watch::Receiver<LockStatusNotification>,
    outbound: mpsc::Sender<Result<LockStatusNotification, Status>>,
) {
    loop {
        let snapshot = snapshots.borrow_and_update().clone();
        if outbound.send(Ok(snapshot)).await.is_err() {
            return;
        }

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = outbound.closed() => return,
        }
    }
}

async fn prune_periodically(
    logger: slog::Logger,
    table: Arc<StatusTable>,
    period: tokio::time::Duration,
    retention: chrono::Duration,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = interval.tick() => {}
        }

        let pruned = table.prune_expired(Utc::now() - retention);
        if pruned > 0 {
            slog::info!(logger, "Pruned {} expired statuses", pruned);
        }
    }
}

#[async_trait::async_trait]
impl ReactiveLockGrpc for LockStatusServer {
    type SubscribeLockStatusStream = ReceiverStream<Result<LockStatusNotification, Status>>;

    async fn subscribe_lock_status(
        &self,
        rpc_request_wrapped: Request<Streaming<LockStatusRequest>>,
    ) -> Result<Response<Self::SubscribeLockStatusStream>, Status> {
        let inbound = rpc_request_wrapped.into_inner();
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);

        tokio::task::spawn(Self::handle_subscription(
            self.logger.clone(),
            self.table.clone(),
            inbound,
            tx,
        ));

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn set_status(
        &self,
        rpc_request_wrapped: Request<LockStatusRequest>,
    ) -> Result<Response<SetStatusReply>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        Self::validate_request(&rpc_request)?;
        self.table.upsert(rpc_request);

        Ok(Response::new(SetStatusReply {
            // Empty
        }))
    }
}
