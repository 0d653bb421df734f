use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Pair controlling when `LockStatusServer::run` returns. Dropping the handle stops the server.
pub fn shutdown_signal() -> (LockStatusServerShutdownHandle, LockStatusServerShutdownSignal) {
    let (tx, rx) = oneshot::channel();

    (
        LockStatusServerShutdownHandle { _tx: tx },
        LockStatusServerShutdownSignal { rx },
    )
}

pub struct LockStatusServerShutdownHandle {
    _tx: oneshot::Sender<()>,
}

pub struct LockStatusServerShutdownSignal {
    rx: oneshot::Receiver<()>,
}

impl Future for LockStatusServerShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped handle counts the same as a sent value.
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}
