use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::model::{ChatMessage, ChatRoom, Complaint, MessageRecord, User};
use crate::domain::repositories::{BusFrame, BusSubscription, RoomBus, Storage};

#[derive(Default)]
struct InMemoryState {
    users: HashMap<String, User>,
    rooms: HashMap<String, ChatRoom>,
    messages: Vec<MessageRecord>,
    next_message_id: i64,
    complaints: Vec<Complaint>,
    next_complaint_id: i64,
    queue: HashSet<String>,
    bans: HashMap<String, i64>,
    user_states: HashMap<String, String>,
    attributes: HashMap<(String, String), String>,
}

#[derive(Default, Clone)]
pub struct InMemoryStorage {
    inner: Arc<RwLock<InMemoryState>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接植入一个用户（测试与本地运行用）
    pub async fn seed_user(&self, user: User) {
        let mut guard = self.inner.write().await;
        guard.users.insert(user.id.clone(), user);
    }

    /// 直接植入一个房间，绕过活跃房间校验（测试用）
    pub async fn seed_room(&self, room: ChatRoom) {
        let mut guard = self.inner.write().await;
        guard.rooms.insert(room.room_id.clone(), room);
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn save_user_if_absent(&self, external_id: i64) -> Result<User> {
        let mut guard = self.inner.write().await;
        if let Some(user) = guard
            .users
            .values()
            .find(|u| u.external_id == Some(external_id))
        {
            return Ok(user.clone());
        }
        let user = User::new(Uuid::new_v4().to_string(), Some(external_id));
        guard.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<User>> {
        let guard = self.inner.read().await;
        Ok(guard.users.get(user_id).cloned())
    }

    async fn get_user_by_external(&self, external_id: i64) -> Result<Option<User>> {
        let guard = self.inner.read().await;
        Ok(guard
            .users
            .values()
            .find(|u| u.external_id == Some(external_id))
            .cloned())
    }

    async fn get_users_by_ids(&self, user_ids: &[String]) -> Result<Vec<User>> {
        let guard = self.inner.read().await;
        Ok(user_ids
            .iter()
            .filter_map(|id| guard.users.get(id).cloned())
            .collect())
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn update_reputation(&self, user_id: &str, delta: i32) -> Result<()> {
        let mut guard = self.inner.write().await;
        if let Some(user) = guard.users.get_mut(user_id) {
            user.reputation = (user.reputation + delta).clamp(0, 1000);
        }
        Ok(())
    }

    async fn update_language(&self, user_id: &str, language: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        if let Some(user) = guard.users.get_mut(user_id) {
            user.language = language.to_string();
        }
        Ok(())
    }

    async fn update_media_spoiler(&self, user_id: &str, value: bool) -> Result<()> {
        let mut guard = self.inner.write().await;
        if let Some(user) = guard.users.get_mut(user_id) {
            user.media_spoiler = value;
        }
        Ok(())
    }

    async fn set_user_state(&self, user_id: &str, state: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard
            .user_states
            .insert(user_id.to_string(), state.to_string());
        Ok(())
    }

    async fn get_user_state(&self, user_id: &str) -> Result<Option<String>> {
        let guard = self.inner.read().await;
        Ok(guard.user_states.get(user_id).cloned())
    }

    async fn clear_user_state(&self, user_id: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard.user_states.remove(user_id);
        Ok(())
    }

    async fn set_attribute(&self, user_id: &str, key: &str, value: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard
            .attributes
            .insert((user_id.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    async fn get_attribute(&self, user_id: &str, key: &str) -> Result<Option<String>> {
        let guard = self.inner.read().await;
        Ok(guard
            .attributes
            .get(&(user_id.to_string(), key.to_string()))
            .cloned())
    }

    async fn delete_attribute(&self, user_id: &str, key: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard
            .attributes
            .remove(&(user_id.to_string(), key.to_string()));
        Ok(())
    }

    async fn block(&self, blocker_id: &str, blocked_id: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        if let Some(user) = guard.users.get_mut(blocker_id) {
            if !user.has_blocked(blocked_id) {
                user.blocked_users.push(blocked_id.to_string());
            }
        }
        Ok(())
    }

    async fn unblock(&self, blocker_id: &str, blocked_id: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        if let Some(user) = guard.users.get_mut(blocker_id) {
            user.blocked_users.retain(|id| id != blocked_id);
        }
        Ok(())
    }

    async fn is_banned(&self, user_id: &str) -> Result<bool> {
        let mut guard = self.inner.write().await;
        match guard.bans.get(user_id).copied() {
            Some(0) => Ok(true),
            Some(expiry) if expiry > Utc::now().timestamp() => Ok(true),
            Some(_) => {
                guard.bans.remove(user_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn ban(&self, user_id: &str, duration_secs: u64) -> Result<()> {
        let mut guard = self.inner.write().await;
        let expiry = if duration_secs == 0 {
            0
        } else {
            Utc::now().timestamp() + duration_secs as i64
        };
        guard.bans.insert(user_id.to_string(), expiry);
        Ok(())
    }

    async fn unban(&self, user_id: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard.bans.remove(user_id);
        Ok(())
    }

    async fn last_ban_date(&self, user_id: &str) -> Result<i64> {
        let guard = self.inner.read().await;
        Ok(guard
            .users
            .get(user_id)
            .map(|u| u.last_ban_date)
            .unwrap_or(0))
    }

    async fn save_room(&self, room: &ChatRoom) -> Result<()> {
        let mut guard = self.inner.write().await;
        let conflict = guard.rooms.values().any(|existing| {
            existing.is_active
                && existing.room_id != room.room_id
                && [&room.user1_id, &room.user2_id].iter().any(|uid| {
                    existing.user1_id == **uid || existing.user2_id == **uid
                })
        });
        if conflict {
            bail!("participant already has an active room");
        }
        guard.rooms.insert(room.room_id.clone(), room.clone());
        Ok(())
    }

    async fn close_room(&self, room_id: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        if let Some(room) = guard.rooms.get_mut(room_id) {
            room.is_active = false;
            room.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn get_room_by_id(&self, room_id: &str) -> Result<Option<ChatRoom>> {
        let guard = self.inner.read().await;
        Ok(guard.rooms.get(room_id).cloned())
    }

    async fn active_room_ids(&self) -> Result<Vec<String>> {
        let guard = self.inner.read().await;
        Ok(guard
            .rooms
            .values()
            .filter(|r| r.is_active)
            .map(|r| r.room_id.clone())
            .collect())
    }

    async fn active_room_id_for(&self, user_id: &str) -> Result<Option<String>> {
        let guard = self.inner.read().await;
        Ok(guard
            .rooms
            .values()
            .find(|r| r.is_active && (r.user1_id == user_id || r.user2_id == user_id))
            .map(|r| r.room_id.clone()))
    }

    async fn save_message(&self, message: &ChatMessage) -> Result<i64> {
        let mut guard = self.inner.write().await;
        guard.next_message_id += 1;
        let id = guard.next_message_id;
        guard.messages.push(MessageRecord {
            id,
            room_id: message.room_id.clone(),
            sender_id: message.sender_id.clone(),
            kind: message.kind,
            body: message.body.clone(),
            caption: message.caption.clone(),
            reply_to_id: message.reply_to_id,
            transport_id_sender: message.transport_id_sender,
            transport_id_receiver: None,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn get_history(&self, room_id: &str) -> Result<Vec<MessageRecord>> {
        let guard = self.inner.read().await;
        Ok(guard
            .messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect())
    }

    async fn find_message_by_id(&self, id: i64) -> Result<Option<MessageRecord>> {
        let guard = self.inner.read().await;
        Ok(guard.messages.iter().find(|m| m.id == id).cloned())
    }

    async fn save_transport_id(
        &self,
        history_id: i64,
        user_id: &str,
        transport_msg_id: i64,
    ) -> Result<()> {
        let mut guard = self.inner.write().await;
        if let Some(record) = guard.messages.iter_mut().find(|m| m.id == history_id) {
            if record.sender_id == user_id {
                record.transport_id_sender = Some(transport_msg_id);
            } else {
                record.transport_id_receiver = Some(transport_msg_id);
            }
        }
        Ok(())
    }

    async fn lookup_history_id_by_transport_id(
        &self,
        transport_msg_id: i64,
    ) -> Result<Option<i64>> {
        let guard = self.inner.read().await;
        Ok(guard
            .messages
            .iter()
            .rev()
            .find(|m| {
                m.transport_id_sender == Some(transport_msg_id)
                    || m.transport_id_receiver == Some(transport_msg_id)
            })
            .map(|m| m.id))
    }

    async fn lookup_history_id_by_transport_id_media(
        &self,
        transport_msg_id: i64,
    ) -> Result<Option<i64>> {
        let guard = self.inner.read().await;
        // 同一媒体（相同 body）按最早一条归并，再取归并结果里最新的
        let mut earliest_by_body: HashMap<&str, &MessageRecord> = HashMap::new();
        for record in guard.messages.iter().filter(|m| {
            m.transport_id_sender == Some(transport_msg_id)
                || m.transport_id_receiver == Some(transport_msg_id)
        }) {
            earliest_by_body
                .entry(record.body.as_str())
                .and_modify(|existing| {
                    if record.created_at < existing.created_at {
                        *existing = record;
                    }
                })
                .or_insert(record);
        }
        Ok(earliest_by_body
            .values()
            .max_by_key(|m| m.created_at)
            .map(|m| m.id))
    }

    async fn lookup_partner_transport_id_for_reply(
        &self,
        history_id: i64,
        current_recipient_id: &str,
    ) -> Result<Option<i64>> {
        let guard = self.inner.read().await;
        let Some(record) = guard.messages.iter().find(|m| m.id == history_id) else {
            return Ok(None);
        };
        if record.sender_id == current_recipient_id {
            Ok(record.transport_id_sender)
        } else {
            Ok(record.transport_id_receiver)
        }
    }

    async fn save_complaint(&self, complaint: &Complaint) -> Result<i64> {
        let mut guard = self.inner.write().await;
        guard.next_complaint_id += 1;
        let id = guard.next_complaint_id;
        let mut stored = complaint.clone();
        stored.id = id;
        guard.complaints.push(stored);
        Ok(id)
    }

    async fn get_complaint_by_id(&self, complaint_id: i64) -> Result<Option<Complaint>> {
        let guard = self.inner.read().await;
        Ok(guard.complaints.iter().find(|c| c.id == complaint_id).cloned())
    }

    async fn complaints_for_user(
        &self,
        suspect_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Complaint>> {
        let guard = self.inner.read().await;
        Ok(guard
            .complaints
            .iter()
            .filter(|c| c.suspect_id == suspect_id && c.created_at >= since)
            .cloned()
            .collect())
    }

    async fn complaints_by_room_and_suspect(
        &self,
        room_id: &str,
        suspect_id: &str,
    ) -> Result<Vec<Complaint>> {
        let guard = self.inner.read().await;
        Ok(guard
            .complaints
            .iter()
            .filter(|c| c.room_id == room_id && c.suspect_id == suspect_id)
            .cloned()
            .collect())
    }

    async fn complaints_by_reporter_since(
        &self,
        reporter_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Complaint>> {
        let guard = self.inner.read().await;
        Ok(guard
            .complaints
            .iter()
            .filter(|c| c.reporter_id == reporter_id && c.created_at >= since)
            .cloned()
            .collect())
    }

    async fn enqueue_search(&self, user_id: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard.queue.insert(user_id.to_string());
        Ok(())
    }

    async fn dequeue_search(&self, user_id: &str) -> Result<()> {
        let mut guard = self.inner.write().await;
        guard.queue.remove(user_id);
        Ok(())
    }

    async fn list_waiting(&self) -> Result<Vec<String>> {
        let guard = self.inner.read().await;
        Ok(guard.queue.iter().cloned().collect())
    }
}

/// 进程内总线：同频道保序，多订阅者各自收到全部帧
#[derive(Default, Clone)]
pub struct InMemoryBus {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<BusFrame>>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoomBus for InMemoryBus {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<()> {
        let frame = BusFrame {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        };
        let mut subscribers = self.subscribers.lock().await;
        let mut alive = Vec::with_capacity(subscribers.len());
        for tx in subscribers.drain(..) {
            if tx.send(frame.clone()).await.is_ok() {
                alive.push(tx);
            }
        }
        *subscribers = alive;
        Ok(())
    }

    async fn subscribe_all(&self) -> Result<BusSubscription> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers.lock().await.push(tx);
        Ok(BusSubscription::new(rx, CancellationToken::new()))
    }
}
