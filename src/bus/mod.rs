//! Coordination bus
//!
//! Wraps the Redis connection the daemon coordinates through: a hash watcher
//! for inbound `mode` requests, a hash publisher for `mode`/`status`, and
//! list-queue pushes toward downstream services.

mod publisher;
mod watcher;

pub use publisher::HashPublisher;
pub use watcher::HashWatcher;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::debug;

use crate::config::Config;
use crate::error::Result;

pub struct BusClient {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl BusClient {
    /// Connect to the bus and verify the connection with a round trip.
    /// A failure here is fatal to daemon startup.
    pub async fn connect(config: &Config) -> Result<Self> {
        let info = redis::ConnectionInfo {
            addr: redis::ConnectionAddr::Tcp(config.redis_host.clone(), config.redis_port),
            redis: redis::RedisConnectionInfo {
                db: 0,
                username: None,
                password: config.redis_password.clone(),
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        debug!(
            "connected to bus at {}:{}",
            config.redis_host, config.redis_port
        );
        Ok(Self { client, conn })
    }

    /// Publisher for a single hash, with round-trip-confirmed writes
    pub fn hash_publisher(&self, hash: &str) -> HashPublisher {
        HashPublisher::new(self.conn.clone(), hash)
    }

    /// Watcher for a single field of a hash
    pub fn hash_watcher(&self, hash: &str, field: &str) -> HashWatcher {
        HashWatcher::new(self.client.clone(), self.conn.clone(), hash, field)
    }

    /// Push a payload onto a list queue
    pub async fn push(&self, queue: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(queue, payload).await?;
        debug!("pushed to {queue}: {payload}");
        Ok(())
    }
}
