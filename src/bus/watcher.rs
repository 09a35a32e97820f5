//! Hash field watcher
//!
//! Subscribes to a hash's notification channel and re-reads the watched
//! field on every change, forwarding the trimmed value to the consumer.
//! The current value is also read once at start, so a request issued while
//! the daemon was down is not lost.

use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;

pub struct HashWatcher {
    client: redis::Client,
    conn: MultiplexedConnection,
    hash: String,
    field: String,
}

impl HashWatcher {
    pub(super) fn new(
        client: redis::Client,
        conn: MultiplexedConnection,
        hash: &str,
        field: &str,
    ) -> Self {
        Self {
            client,
            conn,
            hash: hash.to_string(),
            field: field.to_string(),
        }
    }

    /// Subscribe and spawn the watch loop.
    ///
    /// Subscription failure is returned to the caller (fatal at startup);
    /// errors after that are logged and the loop keeps running.
    pub async fn start(
        self,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.hash).await?;
        info!("watching hash {} field {}", self.hash, self.field);
        Ok(tokio::spawn(self.run(pubsub, tx, cancel)))
    }

    async fn run(
        self,
        mut pubsub: redis::aio::PubSub,
        tx: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) {
        // Initial sync: deliver the field's current value, if any
        self.forward_current(&tx).await;

        let mut messages = pubsub.on_message();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        warn!("bus subscription closed");
                        break;
                    };
                    match msg.get_payload::<String>() {
                        Ok(payload) if payload == self.field => {
                            self.forward_current(&tx).await;
                        }
                        Ok(payload) => {
                            debug!("ignoring notification for field {payload:?}");
                        }
                        Err(e) => warn!("bad bus notification payload: {e}"),
                    }
                }
            }
        }
        debug!("hash watcher for {} stopped", self.hash);
    }

    async fn forward_current(&self, tx: &mpsc::Sender<String>) {
        let mut conn = self.conn.clone();
        let value: Option<String> = match conn.hget(&self.hash, &self.field).await {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to read {}.{}: {e}", self.hash, self.field);
                return;
            }
        };
        let Some(value) = value else {
            debug!("{}.{} not set", self.hash, self.field);
            return;
        };
        let value = value.trim().to_string();
        if value.is_empty() {
            debug!("{}.{} is empty, ignoring", self.hash, self.field);
            return;
        }
        if tx.send(value).await.is_err() {
            debug!("mode consumer gone");
        }
    }
}
