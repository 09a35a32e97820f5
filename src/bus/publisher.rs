//! Hash field publisher

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::error::Result;

/// Publishes fields of one hash with confirmed writes.
///
/// Each `set` performs the hash write and then notifies the hash's channel
/// with the field name, which is the change-notification protocol the
/// watcher side consumes.
#[derive(Clone)]
pub struct HashPublisher {
    conn: MultiplexedConnection,
    hash: String,
}

impl HashPublisher {
    pub(super) fn new(conn: MultiplexedConnection, hash: &str) -> Self {
        Self {
            conn,
            hash: hash.to_string(),
        }
    }

    /// Set `field` to `value`; returns once the server has confirmed both
    /// the write and the notification.
    pub async fn set(&self, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(&self.hash, field, value).await?;
        let _: () = conn.publish(&self.hash, field).await?;
        Ok(())
    }
}
