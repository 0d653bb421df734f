use crate::redis_store::HashChannel;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const CHANNEL_CAPACITY: usize = 64;

/// In-process stand-in for a Redis server, shared by every store of a test through an `Arc`.
pub struct InMemoryHashChannel {
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    unavailable: AtomicBool,
}

impl InMemoryHashChannel {
    pub fn new() -> Self {
        InMemoryHashChannel {
            hashes: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// While unavailable, writes and reads fail like a lost connection.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn field(&self, hash_key: &str, field: &str) -> Option<String> {
        self.lock_hashes().get(hash_key).and_then(|hash| hash.get(field)).cloned()
    }

    fn check_available(&self) -> redis::RedisResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "in-memory redis is unavailable",
            )));
        }
        Ok(())
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .lock()
            .expect("InMemoryHashChannel channels mutex guard poison")
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    fn lock_hashes(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, String>>> {
        self.hashes.lock().expect("InMemoryHashChannel hashes mutex guard poison")
    }
}

impl Default for InMemoryHashChannel {
    fn default() -> Self {
        InMemoryHashChannel::new()
    }
}

#[async_trait::async_trait]
impl HashChannel for InMemoryHashChannel {
    async fn write_and_publish(
        &self,
        hash_key: &str,
        field: &str,
        channel: &str,
        value: &str,
    ) -> redis::RedisResult<()> {
        self.check_available()?;
        self.lock_hashes()
            .entry(hash_key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        // No subscribers is fine, just like PUBLISH.
        let _ = self.sender(channel).send(value.to_string());
        Ok(())
    }

    async fn read_all(&self, hash_key: &str) -> redis::RedisResult<HashMap<String, String>> {
        self.check_available()?;
        Ok(self.lock_hashes().get(hash_key).cloned().unwrap_or_default())
    }

    async fn subscribe(&self, channel: &str) -> redis::RedisResult<BoxStream<'static, String>> {
        self.check_available()?;
        let receiver = self.sender(channel).subscribe();
        // A lagged subscriber skips ahead; the next payload triggers a full re-read anyway.
        let payloads = BroadcastStream::new(receiver).filter_map(|payload| async move { payload.ok() });
        Ok(payloads.boxed())
    }
}
