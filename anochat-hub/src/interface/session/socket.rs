//! socket 会话适配器
//!
//! 出站泵从有界队列取消息写给传输层，并按 pong 超时的 9/10 周期
//! 发送 ping 保活；每次写都有独立的写超时。入站方向由传输层自己
//! 驱动（解码后直接推给枢纽收件箱）。

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, warn};

use crate::config::HubConfig;
use crate::domain::model::ChatMessage;
use crate::domain::session::ChatSession;

/// 帧传输接口
///
/// 具体的 socket 传输层（字节编解码、握手）在核心之外实现。
#[async_trait]
pub trait FrameTransport: Send + Sync + 'static {
    async fn send_message(&self, message: &ChatMessage) -> Result<()>;
    async fn send_ping(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// socket 会话
pub struct SocketSession<T: FrameTransport> {
    user_id: String,
    room_id: RwLock<String>,
    transport: Arc<T>,
    outbound_tx: Mutex<Option<mpsc::Sender<ChatMessage>>>,
    outbound_rx: Mutex<Option<mpsc::Receiver<ChatMessage>>>,
    write_wait: Duration,
    ping_period: Duration,
}

impl<T: FrameTransport> SocketSession<T> {
    /// 创建会话
    ///
    /// 重连场景下传输层应先查询持久化中的活跃房间并通过 `room_id`
    /// 预填，再把会话交给枢纽注册。
    pub fn new(user_id: &str, room_id: &str, transport: Arc<T>, config: &HubConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.session_outbound_depth);
        Self {
            user_id: user_id.to_string(),
            room_id: RwLock::new(room_id.to_string()),
            transport,
            outbound_tx: Mutex::new(Some(tx)),
            outbound_rx: Mutex::new(Some(rx)),
            write_wait: config.write_wait,
            ping_period: config.ping_period,
        }
    }
}

impl<T: FrameTransport> ChatSession for SocketSession<T> {
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
        let user_id = self.user_id.clone();
        let write_wait = self.write_wait;
        let ping_period = self.ping_period;

        tokio::spawn(async move {
            let mut ping = interval_at(Instant::now() + ping_period, ping_period);
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    maybe_message = rx.recv() => match maybe_message {
                        Some(message) => {
                            match timeout(write_wait, transport.send_message(&message)).await {
                                Ok(Ok(())) => {}
                                Ok(Err(err)) => {
                                    warn!(%user_id, error = %err, "socket write failed");
                                    break;
                                }
                                Err(_) => {
                                    warn!(%user_id, "socket write deadline exceeded");
                                    break;
                                }
                            }
                        }
                        // 出站队列已被关闭并清空
                        None => {
                            let _ = transport.close().await;
                            break;
                        }
                    },
                    _ = ping.tick() => {
                        match timeout(write_wait, transport.send_ping()).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                warn!(%user_id, error = %err, "keepalive ping failed");
                                break;
                            }
                            Err(_) => {
                                warn!(%user_id, "keepalive ping deadline exceeded");
                                break;
                            }
                        }
                    }
                }
            }
            debug!(%user_id, "socket outbound pump stopped");
        });
    }

    fn close(&self) {
        // 丢掉发送端；泵在清空剩余消息后退出。重复调用无效果。
        self.outbound_tx
            .lock()
            .expect("outbound lock poisoned")
            .take();
    }
}
