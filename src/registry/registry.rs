use crate::controller::{CounterCreationError, UsageCounter};
use crate::gate::{GateHandlers, LockGate};
use crate::store::LocalStore;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// LockRegistry maps lock keys to the gate and controller of each lock. Build one at startup
/// and hand it to whatever needs to look locks up.
pub struct LockRegistry {
    logger: slog::Logger,
    locks: RwLock<HashMap<String, RegisteredLock>>,
}

struct RegisteredLock {
    gate: Arc<LockGate>,
    controller: Arc<UsageCounter>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("lock '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("lock '{0}' is not registered")]
    NotFound(String),
    #[error("cannot create controller")]
    Controller(#[from] CounterCreationError),
}

impl LockRegistry {
    pub fn new(logger: slog::Logger) -> Self {
        LockRegistry {
            logger,
            locks: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        lock_key: &str,
        gate: Arc<LockGate>,
        controller: Arc<UsageCounter>,
    ) -> Result<(), RegistryError> {
        let mut locks = self.locks.write().expect("LockRegistry lock guard poison");
        if locks.contains_key(lock_key) {
            return Err(RegistryError::AlreadyRegistered(lock_key.to_string()));
        }
        locks.insert(lock_key.to_string(), RegisteredLock { gate, controller });

        slog::info!(self.logger, "Registered lock '{}'", lock_key);
        Ok(())
    }

    /// Registers a lock whose state lives only in this process.
    pub fn register_local(
        &self,
        lock_key: &str,
        instance_name: &str,
        busy_threshold: u64,
        handlers: GateHandlers,
    ) -> Result<(Arc<LockGate>, Arc<UsageCounter>), RegistryError> {
        let logger = self.logger.new(slog::o!("LockKey" => lock_key.to_string()));
        let gate = Arc::new(LockGate::with_handlers(logger, handlers));
        let store = Arc::new(LocalStore::new(gate.clone()));
        let controller = Arc::new(UsageCounter::new(store, instance_name, busy_threshold)?);

        self.register(lock_key, gate.clone(), controller.clone())?;
        Ok((gate, controller))
    }

    pub fn gate(&self, lock_key: &str) -> Result<Arc<LockGate>, RegistryError> {
        self.find(lock_key, |lock| lock.gate.clone())
    }

    pub fn controller(&self, lock_key: &str) -> Result<Arc<UsageCounter>, RegistryError> {
        self.find(lock_key, |lock| lock.controller.clone())
    }

    pub fn lock_keys(&self) -> Vec<String> {
        self.locks
            .read()
            .expect("LockRegistry lock guard poison")
            .keys()
            .cloned()
            .collect()
    }

    fn find<T>(&self, lock_key: &str, pick: impl FnOnce(&RegisteredLock) -> T) -> Result<T, RegistryError> {
        self.locks
            .read()
            .expect("LockRegistry lock guard poison")
            .get(lock_key)
            .map(pick)
            .ok_or_else(|| RegistryError::NotFound(lock_key.to_string()))
    }
}
