use crate::consensus::split_lock_data;
use crate::gate::handlers::{self, GateHandlers};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::time::Duration;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// LockGate is the in-process busy/idle signal for one lock key.
///
/// While blocked, the gate owns one generation of a wait handle. Every waiter that arrives
/// during that generation parks on it, and unblocking resolves the whole generation at once.
/// The next `set_blocked` arms a fresh generation.
pub struct LockGate {
    logger: slog::Logger,
    state: Mutex<GateState>,
    handlers: GateHandlers,
}

struct GateState {
    // `None` means unblocked.
    generation: Option<watch::Sender<bool>>,
    lock_data: Option<String>,
}

/// One armed generation of the gate's wait handle, as seen by a waiter.
struct Generation {
    resolved: watch::Receiver<bool>,
}

impl Generation {
    fn is_resolved(&self) -> bool {
        *self.resolved.borrow()
    }

    async fn wait(mut self) {
        while !*self.resolved.borrow_and_update() {
            if self.resolved.changed().await.is_err() {
                // Sender is gone, which only happens after it resolved the generation.
                return;
            }
        }
    }
}

impl LockGate {
    pub fn new(logger: slog::Logger) -> Self {
        Self::with_handlers(logger, GateHandlers::new())
    }

    pub fn with_handlers(logger: slog::Logger, handlers: GateHandlers) -> Self {
        LockGate {
            logger,
            state: Mutex::new(GateState {
                generation: None,
                lock_data: None,
            }),
            handlers,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.lock_state().generation.is_some()
    }

    /// The data attached by whoever blocked the gate, `None` when unblocked.
    pub fn lock_data(&self) -> Option<String> {
        self.lock_state().lock_data.clone()
    }

    /// `lock_data()` split back into one entry per busy instance.
    pub fn lock_data_entries(&self) -> Vec<String> {
        match self.lock_data() {
            Some(data) => split_lock_data(&data),
            None => vec![],
        }
    }

    /// Blocks the gate. Returns false without touching the stored data if it was already
    /// blocked: the first blocker's data stays until the gate is unblocked.
    pub fn set_blocked(&self, lock_data: Option<String>) -> bool {
        {
            let mut state = self.lock_state();
            if state.generation.is_some() {
                return false;
            }
            let (tx, _rx) = watch::channel(false);
            state.generation = Some(tx);
            state.lock_data = lock_data.clone();
        }

        slog::debug!(self.logger, "Gate blocked. LockData: {:?}", lock_data);
        handlers::fire(&self.logger, &self.handlers.on_locked, "on-locked", lock_data);
        true
    }

    /// Unblocks the gate and releases every waiter. Returns false if it was not blocked.
    pub fn set_unblocked(&self) -> bool {
        {
            let mut state = self.lock_state();
            match state.generation.take() {
                Some(generation) => {
                    generation.send_replace(true);
                    state.lock_data = None;
                }
                None => return false,
            }
        }

        slog::debug!(self.logger, "Gate unblocked.");
        handlers::fire(&self.logger, &self.handlers.on_unlocked, "on-unlocked", None);
        true
    }

    /// Waits until the gate is unblocked. Returns whether the gate was blocked on entry.
    pub async fn wait_if_blocked(&self) -> bool {
        self.wait_if_blocked_with(WaitOptions::new()).await
    }

    pub async fn wait_if_blocked_with(&self, options: WaitOptions<'_>) -> bool {
        let generation = match self.lock_state().generation.as_ref() {
            Some(tx) => Generation {
                resolved: tx.subscribe(),
            },
            None => return false,
        };

        let WaitOptions {
            on_blocked,
            while_blocked,
            poll_interval,
        } = options;

        if let Some(on_blocked) = on_blocked {
            on_blocked().await;
        }

        if let Some(mut while_blocked) = while_blocked {
            while !generation.is_resolved() {
                while_blocked().await;
                tokio::time::sleep(poll_interval).await;
            }
            while_blocked().await;
        }

        generation.wait().await;
        true
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().expect("LockGate state mutex guard poison")
    }
}

/// Callbacks for `LockGate::wait_if_blocked_with`.
pub struct WaitOptions<'a> {
    on_blocked: Option<Box<dyn FnOnce() -> BoxFuture<'a, ()> + Send + 'a>>,
    while_blocked: Option<Box<dyn FnMut() -> BoxFuture<'a, ()> + Send + 'a>>,
    poll_interval: Duration,
}

impl<'a> WaitOptions<'a> {
    pub fn new() -> Self {
        WaitOptions {
            on_blocked: None,
            while_blocked: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Called once, before waiting, if the gate is blocked.
    pub fn on_blocked<F, Fut>(mut self, callback: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = ()> + Send + 'a,
    {
        self.on_blocked = Some(Box::new(move || Box::pin(callback())));
        self
    }

    /// Called every poll interval while the gate stays blocked, and once more after it opens.
    pub fn while_blocked<F, Fut>(mut self, mut callback: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'a,
        Fut: Future<Output = ()> + Send + 'a,
    {
        self.while_blocked = Some(Box::new(move || Box::pin(callback())));
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl Default for WaitOptions<'_> {
    fn default() -> Self {
        WaitOptions::new()
    }
}
