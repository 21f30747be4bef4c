//! 领域端口定义
//!
//! 核心只依赖这里的两个接口：`Storage`（持久化端口）与 `RoomBus`
//! （按房间 ID 分频道的扇出总线端口）。"未找到" 一律以 `Ok(None)` /
//! 空集合表示，不作为错误。

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::model::{ChatMessage, ChatRoom, Complaint, MessageRecord, User};

/// 持久化端口
///
/// 用户 / 房间 / 消息 / 投诉落在关系存储，封禁标记、用户状态与
/// 等待队列落在缓存；核心不依赖这种划分。
#[async_trait]
pub trait Storage: Send + Sync {
    // ---- 用户 ----

    /// 按传输层身份查找用户，不存在时创建
    async fn save_user_if_absent(&self, external_id: i64) -> Result<User>;
    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<User>>;
    async fn get_user_by_external(&self, external_id: i64) -> Result<Option<User>>;
    /// 批量拉取用户记录（匹配器每轮只调一次）
    async fn get_users_by_ids(&self, user_ids: &[String]) -> Result<Vec<User>>;
    async fn update_user(&self, user: &User) -> Result<()>;
    /// 调整声誉分，结果截断在 0..=1000
    async fn update_reputation(&self, user_id: &str, delta: i32) -> Result<()>;
    async fn update_language(&self, user_id: &str, language: &str) -> Result<()>;
    async fn update_media_spoiler(&self, user_id: &str, value: bool) -> Result<()>;

    /// 传输层流程状态（如 "awaiting_report_reason"）
    async fn set_user_state(&self, user_id: &str, state: &str) -> Result<()>;
    async fn get_user_state(&self, user_id: &str) -> Result<Option<String>>;
    async fn clear_user_state(&self, user_id: &str) -> Result<()>;

    /// 任意键值属性
    async fn set_attribute(&self, user_id: &str, key: &str, value: &str) -> Result<()>;
    async fn get_attribute(&self, user_id: &str, key: &str) -> Result<Option<String>>;
    async fn delete_attribute(&self, user_id: &str, key: &str) -> Result<()>;

    /// `blocker` 拉黑 `blocked`
    async fn block(&self, blocker_id: &str, blocked_id: &str) -> Result<()>;
    async fn unblock(&self, blocker_id: &str, blocked_id: &str) -> Result<()>;

    /// 封禁标记（缓存键 `ban:<user_id>`）
    async fn is_banned(&self, user_id: &str) -> Result<bool>;
    /// 封禁用户；`duration_secs` 为 0 时为无限期
    async fn ban(&self, user_id: &str, duration_secs: u64) -> Result<()>;
    async fn unban(&self, user_id: &str) -> Result<()>;
    async fn last_ban_date(&self, user_id: &str) -> Result<i64>;

    // ---- 房间 ----

    /// 保存房间；校验双方都不在其他活跃房间中
    async fn save_room(&self, room: &ChatRoom) -> Result<()>;
    /// 关闭房间：active = false，ended_at = now
    async fn close_room(&self, room_id: &str) -> Result<()>;
    async fn get_room_by_id(&self, room_id: &str) -> Result<Option<ChatRoom>>;
    async fn active_room_ids(&self) -> Result<Vec<String>>;
    async fn active_room_id_for(&self, user_id: &str) -> Result<Option<String>>;

    // ---- 消息 ----

    /// 保存消息并返回分配的 ID；调用方负责在发布前填回
    async fn save_message(&self, message: &ChatMessage) -> Result<i64>;
    /// 按时间顺序返回房间消息历史
    async fn get_history(&self, room_id: &str) -> Result<Vec<MessageRecord>>;
    async fn find_message_by_id(&self, id: i64) -> Result<Option<MessageRecord>>;
    /// 记录某参与者侧的传输层消息 ID；按 `user_id` 是否为发送方
    /// 决定写入发送槽还是接收槽
    async fn save_transport_id(
        &self,
        history_id: i64,
        user_id: &str,
        transport_msg_id: i64,
    ) -> Result<()>;
    /// 由传输层消息 ID 反查内部消息 ID（回复解析）
    async fn lookup_history_id_by_transport_id(&self, transport_msg_id: i64)
    -> Result<Option<i64>>;
    /// 媒体编辑场景的反查：相同 body（file id）取最早一条
    async fn lookup_history_id_by_transport_id_media(
        &self,
        transport_msg_id: i64,
    ) -> Result<Option<i64>>;
    /// 返回对端参与者那一侧的传输层消息 ID，用于回复定位
    async fn lookup_partner_transport_id_for_reply(
        &self,
        history_id: i64,
        current_recipient_id: &str,
    ) -> Result<Option<i64>>;

    // ---- 投诉 ----

    /// 保存投诉并返回分配的 ID
    async fn save_complaint(&self, complaint: &Complaint) -> Result<i64>;
    async fn get_complaint_by_id(&self, complaint_id: i64) -> Result<Option<Complaint>>;
    async fn complaints_for_user(
        &self,
        suspect_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Complaint>>;
    async fn complaints_by_room_and_suspect(
        &self,
        room_id: &str,
        suspect_id: &str,
    ) -> Result<Vec<Complaint>>;
    async fn complaints_by_reporter_since(
        &self,
        reporter_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Complaint>>;

    // ---- 等待队列 ----

    async fn enqueue_search(&self, user_id: &str) -> Result<()>;
    async fn dequeue_search(&self, user_id: &str) -> Result<()>;
    async fn list_waiting(&self) -> Result<Vec<String>>;
}

/// 总线上的一帧：频道名即房间 ID，负载为 JSON 序列化的 [`ChatMessage`]
#[derive(Clone, Debug)]
pub struct BusFrame {
    pub channel: String,
    pub payload: Vec<u8>,
}

impl BusFrame {
    /// 反序列化负载
    pub fn decode(&self) -> Result<ChatMessage> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// 模式订阅句柄
///
/// 持有转发任务的接收端；`close` 幂等，取消转发任务并让 `recv`
/// 返回 `None`。
pub struct BusSubscription {
    rx: mpsc::Receiver<BusFrame>,
    cancel: CancellationToken,
}

impl BusSubscription {
    pub fn new(rx: mpsc::Receiver<BusFrame>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    pub async fn recv(&mut self) -> Option<BusFrame> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            frame = self.rx.recv() => frame,
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 扇出总线端口
///
/// 同一频道内保持发布顺序，不同频道间无顺序保证。
#[async_trait]
pub trait RoomBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()>;
    /// 订阅全部房间频道；返回时订阅已得到服务端确认
    async fn subscribe_all(&self) -> Result<BusSubscription>;
}
