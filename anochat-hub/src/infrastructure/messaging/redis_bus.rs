//! Redis Pub/Sub 扇出总线
//!
//! 频道名即房间 ID。发布走共享连接；订阅用独立的 Pub/Sub 连接对
//! `*` 做模式订阅，由后台任务把帧转发给订阅句柄。

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::repositories::{BusFrame, BusSubscription, RoomBus};

const SUBSCRIPTION_BUFFER: usize = 256;

/// Redis 实现的房间总线
pub struct RedisRoomBus {
    client: Arc<redis::Client>,
    publisher: ConnectionManager,
}

impl RedisRoomBus {
    pub fn new(client: Arc<redis::Client>, publisher: ConnectionManager) -> Self {
        Self { client, publisher }
    }
}

#[async_trait]
impl RoomBus for RedisRoomBus {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let mut conn = self.publisher.clone();
        let _: i64 = conn
            .publish(channel, payload)
            .await
            .context("failed to publish to room channel")?;
        Ok(())
    }

    async fn subscribe_all(&self) -> Result<BusSubscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed to open pubsub connection")?;
        // psubscribe 返回即表示收到了服务端的订阅确认帧
        pubsub
            .psubscribe("*")
            .await
            .context("failed to pattern subscribe to room channels")?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    maybe_msg = stream.next() => {
                        let Some(msg) = maybe_msg else {
                            warn!("redis pubsub stream ended");
                            break;
                        };
                        let frame = BusFrame {
                            channel: msg.get_channel_name().to_string(),
                            payload: msg.get_payload_bytes().to_vec(),
                        };
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("redis pubsub forwarder stopped");
        });

        Ok(BusSubscription::new(rx, cancel))
    }
}
