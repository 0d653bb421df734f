use futures::stream::{BoxStream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;

/// The Redis operations the store needs: a hash holding every instance's status, and a
/// pub/sub channel announcing changes to it.
#[async_trait::async_trait]
pub trait HashChannel: Send + Sync {
    /// Writes `value` to `field` of `hash_key`, then publishes it on `channel`.
    async fn write_and_publish(&self, hash_key: &str, field: &str, channel: &str, value: &str)
        -> redis::RedisResult<()>;

    async fn read_all(&self, hash_key: &str) -> redis::RedisResult<HashMap<String, String>>;

    /// Stream of payloads published on `channel`. It ends when the subscription drops.
    async fn subscribe(&self, channel: &str) -> redis::RedisResult<BoxStream<'static, String>>;
}

/// `HashChannel` backed by a Redis server.
pub struct RedisHashChannel {
    client: redis::Client,
    connection: MultiplexedConnection,
}

impl RedisHashChannel {
    pub async fn connect(url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(RedisHashChannel { client, connection })
    }
}

#[async_trait::async_trait]
impl HashChannel for RedisHashChannel {
    async fn write_and_publish(
        &self,
        hash_key: &str,
        field: &str,
        channel: &str,
        value: &str,
    ) -> redis::RedisResult<()> {
        let mut connection = self.connection.clone();
        // HSET + PUBLISH in one round trip.
        redis::pipe()
            .hset(hash_key, field, value)
            .ignore()
            .publish(channel, value)
            .ignore()
            .query_async::<()>(&mut connection)
            .await
    }

    async fn read_all(&self, hash_key: &str) -> redis::RedisResult<HashMap<String, String>> {
        let mut connection = self.connection.clone();
        connection.hgetall(hash_key).await
    }

    async fn subscribe(&self, channel: &str) -> redis::RedisResult<BoxStream<'static, String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let payloads = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(payloads.boxed())
    }
}
