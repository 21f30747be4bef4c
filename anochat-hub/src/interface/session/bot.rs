//! bot 会话适配器
//!
//! 针对长轮询类传输：没有保活，投递失败不终止会话。每条消息投递
//! 成功后把传输侧分配的消息 ID 写回消息行，供回复与编辑解析。

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::HubConfig;
use crate::domain::model::ChatMessage;
use crate::domain::repositories::Storage;
use crate::domain::session::ChatSession;

/// bot 传输接口
///
/// bot API 调用本身（上传、命令解析、本地化）在核心之外实现。
#[async_trait]
pub trait BotTransport: Send + Sync + 'static {
    /// 投递消息并返回传输侧分配的消息 ID
    ///
    /// `reply_to_transport_id` 已经解析为接收方那一侧的传输 ID。
    async fn deliver(
        &self,
        message: &ChatMessage,
        reply_to_transport_id: Option<i64>,
    ) -> Result<i64>;
}

/// bot 会话
pub struct BotSession<T: BotTransport> {
    user_id: String,
    room_id: RwLock<String>,
    transport: Arc<T>,
    storage: Arc<dyn Storage>,
    outbound_tx: Mutex<Option<mpsc::Sender<ChatMessage>>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<ChatMessage>>>,
    write_wait: Duration,
}

impl<T: BotTransport> BotSession<T> {
    pub fn new(
        user_id: &str,
        room_id: &str,
        transport: Arc<T>,
        storage: Arc<dyn Storage>,
        config: &HubConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.session_outbound_depth);
        Self {
            user_id: user_id.to_string(),
            room_id: RwLock::new(room_id.to_string()),
            transport,
            storage,
            outbound_tx: Mutex::new(Some(tx)),
            outbound_rx: Mutex::new(Some(rx)),
            write_wait: config.write_wait,
        }
    }
}

impl<T: BotTransport> ChatSession for BotSession<T> {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn room_id(&self) -> String {
        self.room_id.read().expect("room id lock poisoned").clone()
    }

    fn set_room_id(&self, room_id: &str) {
        *self.room_id.write().expect("room id lock poisoned") = room_id.to_string();
    }

    fn outbound(&self) -> Option<mpsc::Sender<ChatMessage>> {
        self.outbound_tx
            .lock()
            .expect("outbound lock poisoned")
            .clone()
    }

    fn start(self: Arc<Self>) {
        let Some(mut rx) = self
            .outbound_rx
            .lock()
            .expect("outbound lock poisoned")
            .take()
        else {
            return;
        };
        let transport = Arc::clone(&self.transport);
        let storage = Arc::clone(&self.storage);
        let user_id = self.user_id.clone();
        let write_wait = self.write_wait;

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                // 回复定位：把内部消息引用翻译为本接收方可见的传输 ID
                let reply_target = match message.reply_to_id {
                    Some(history_id) => match storage
                        .lookup_partner_transport_id_for_reply(history_id, &user_id)
                        .await
                    {
                        Ok(target) => target,
                        Err(err) => {
                            warn!(%user_id, history_id, error = %err, "failed to resolve reply target");
                            None
                        }
                    },
                    None => None,
                };

                match timeout(write_wait, transport.deliver(&message, reply_target)).await {
                    Ok(Ok(delivered_id)) => {
                        if message.id > 0 {
                            if let Err(err) = storage
                                .save_transport_id(message.id, &user_id, delivered_id)
                                .await
                            {
                                warn!(%user_id, message_id = message.id, error = %err, "failed to record delivered transport id");
                            }
                        }
                    }
                    Ok(Err(err)) => {
                        warn!(%user_id, error = %err, "bot delivery failed, message dropped");
                    }
                    Err(_) => {
                        warn!(%user_id, "bot delivery deadline exceeded, message dropped");
                    }
                }
            }
            debug!(%user_id, "bot outbound pump stopped");
        });
    }

    fn close(&self) {
        self.outbound_tx
            .lock()
            .expect("outbound lock poisoned")
            .take();
    }
}
