use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// A callback fired on a gate transition. It receives the lock data the gate holds right after
/// the transition (always `None` for an unlock).
pub type LockHandler = Arc<dyn Fn(Option<String>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Handlers fired by a `LockGate` when it flips. Each handler runs on its own task and is never
/// awaited by the code that flipped the gate.
#[derive(Clone, Default)]
pub struct GateHandlers {
    pub(super) on_locked: Vec<LockHandler>,
    pub(super) on_unlocked: Vec<LockHandler>,
}

impl GateHandlers {
    pub fn new() -> Self {
        GateHandlers::default()
    }

    pub fn on_locked<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_locked.push(Arc::new(move |data| Box::pin(handler(data))));
        self
    }

    pub fn on_unlocked<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_unlocked.push(Arc::new(move |data| Box::pin(handler(data))));
        self
    }
}

/// Spawns every handler on an independent task. A panicking handler is logged by a watcher
/// task and affects neither the gate nor the other handlers.
pub(super) fn fire(logger: &slog::Logger, handlers: &[LockHandler], transition: &'static str, data: Option<String>) {
    for (index, handler) in handlers.iter().enumerate() {
        let handler = handler.clone();
        let data = data.clone();
        // Called on the task: a handler may panic before returning its future.
        let handler_task = tokio::task::spawn(async move { handler(data).await });
        let logger = logger.clone();
        tokio::task::spawn(async move {
            if let Err(e) = handler_task.await {
                slog::warn!(logger, "{} handler #{} failed: {:?}", transition, index, e);
            }
        });
    }
}
