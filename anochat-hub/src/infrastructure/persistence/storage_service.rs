//! # 持久化服务
//!
//! `Storage` 端口的生产实现：用户 / 房间 / 消息 / 投诉落在
//! PostgreSQL，封禁标记、用户状态与等待队列落在 Redis。

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::domain::model::{
    ChatMessage, ChatRoom, Complaint, ComplaintSeverity, MessageKind, MessageRecord, User,
};
use crate::domain::repositories::Storage;

const BAN_KEY_PREFIX: &str = "ban";
const USER_STATE_KEY_PREFIX: &str = "user_state";
const ATTRIBUTE_KEY_PREFIX: &str = "attr";
const SEARCH_QUEUE_KEY: &str = "search_queue";

/// PostgreSQL + Redis 存储服务
pub struct StorageService {
    pool: PgPool,
    redis: ConnectionManager,
}

impl StorageService {
    pub fn new(pool: PgPool, redis: ConnectionManager) -> Self {
        Self { pool, redis }
    }

    fn ban_key(user_id: &str) -> String {
        format!("{}:{}", BAN_KEY_PREFIX, user_id)
    }

    fn user_state_key(user_id: &str) -> String {
        format!("{}:{}", USER_STATE_KEY_PREFIX, user_id)
    }

    fn attribute_key(user_id: &str, key: &str) -> String {
        format!("{}:{}:{}", ATTRIBUTE_KEY_PREFIX, user_id, key)
    }
}

fn row_to_user(row: &PgRow) -> User {
    User {
        id: row.get("id"),
        external_id: row.get("external_id"),
        language: row.get("language"),
        blocked_users: row.get("blocked_users"),
        is_blocked: row.get("is_blocked"),
        block_end_time: row.get("block_end_time"),
        block_level: row.get("block_level"),
        last_ban_date: row.get("last_ban_date"),
        reputation: row.get("reputation"),
        media_spoiler: row.get("media_spoiler"),
    }
}

fn row_to_room(row: &PgRow) -> ChatRoom {
    ChatRoom {
        room_id: row.get("room_id"),
        user1_id: row.get("user1_id"),
        user2_id: row.get("user2_id"),
        is_active: row.get("is_active"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
    }
}

fn row_to_message(row: &PgRow) -> MessageRecord {
    MessageRecord {
        id: row.get("id"),
        room_id: row.get("room_id"),
        sender_id: row.get("sender_id"),
        kind: MessageKind::from_str(row.get("kind")),
        body: row.get("body"),
        caption: row.get("caption"),
        reply_to_id: row.get("reply_to_id"),
        transport_id_sender: row.get("transport_id_sender"),
        transport_id_receiver: row.get("transport_id_receiver"),
        created_at: row.get("created_at"),
    }
}

fn row_to_complaint(row: &PgRow) -> Complaint {
    Complaint {
        id: row.get("id"),
        room_id: row.get("room_id"),
        reporter_id: row.get("reporter_id"),
        suspect_id: row.get("suspect_id"),
        logged_messages: row.get("logged_messages"),
        reason: row.get("reason"),
        severity: ComplaintSeverity::from_str(row.get("severity")),
        status: row.get("status"),
        created_at: row.get("created_at"),
    }
}

const USER_COLUMNS: &str = "id, external_id, language, blocked_users, is_blocked, \
     block_end_time, block_level, last_ban_date, reputation, media_spoiler";

const MESSAGE_COLUMNS: &str = "id, room_id, sender_id, kind, body, caption, reply_to_id, \
     transport_id_sender, transport_id_receiver, created_at";

const COMPLAINT_COLUMNS: &str =
    "id, room_id, reporter_id, suspect_id, logged_messages, reason, severity, status, created_at";

#[async_trait]
impl Storage for StorageService {
    async fn save_user_if_absent(&self, external_id: i64) -> Result<User> {
        // 先尝试插入，冲突时落到下面的查询（首次接触惰性建档）
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO users (id, external_id) VALUES ($1, $2) \
             ON CONFLICT (external_id) DO NOTHING",
        )
        .bind(&id)
        .bind(external_id)
        .execute(&self.pool)
        .await
        .context("failed to insert user on first contact")?;

        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to load user after insert")?;
        Ok(row_to_user(&row))
    }

    async fn get_user_by_id(&self, user_id: &str) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load user by id")?;
        Ok(row.as_ref().map(row_to_user))
    }

    async fn get_user_by_external(&self, external_id: i64) -> Result<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load user by external id")?;
        Ok(row.as_ref().map(row_to_user))
    }

    async fn get_users_by_ids(&self, user_ids: &[String]) -> Result<Vec<User>> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = ANY($1)"
        ))
        .bind(user_ids)
        .fetch_all(&self.pool)
        .await
        .context("failed to bulk load users")?;
        Ok(rows.iter().map(row_to_user).collect())
    }

    async fn update_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            "UPDATE users SET language = $2, blocked_users = $3, is_blocked = $4, \
             block_end_time = $5, block_level = $6, last_ban_date = $7, reputation = $8, \
             media_spoiler = $9 WHERE id = $1",
        )
        .bind(&user.id)
        .bind(&user.language)
        .bind(&user.blocked_users)
        .bind(user.is_blocked)
        .bind(user.block_end_time)
        .bind(user.block_level)
        .bind(user.last_ban_date)
        .bind(user.reputation)
        .bind(user.media_spoiler)
        .execute(&self.pool)
        .await
        .context("failed to update user")?;
        Ok(())
    }

    async fn update_reputation(&self, user_id: &str, delta: i32) -> Result<()> {
        // 事务内读改写，结果截断在 0..=1000
        let mut tx = self.pool.begin().await.context("failed to begin tx")?;
        let row = sqlx::query("SELECT reputation FROM users WHERE id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to load reputation")?;
        let Some(row) = row else {
            return Ok(());
        };
        let current: i32 = row.get("reputation");
        let updated = (current + delta).clamp(0, 1000);
        sqlx::query("UPDATE users SET reputation = $2 WHERE id = $1")
            .bind(user_id)
            .bind(updated)
            .execute(&mut *tx)
            .await
            .context("failed to update reputation")?;
        tx.commit().await.context("failed to commit reputation")?;
        Ok(())
    }

    async fn update_language(&self, user_id: &str, language: &str) -> Result<()> {
        sqlx::query("UPDATE users SET language = $2 WHERE id = $1")
            .bind(user_id)
            .bind(language)
            .execute(&self.pool)
            .await
            .context("failed to update language")?;
        Ok(())
    }

    async fn update_media_spoiler(&self, user_id: &str, value: bool) -> Result<()> {
        sqlx::query("UPDATE users SET media_spoiler = $2 WHERE id = $1")
            .bind(user_id)
            .bind(value)
            .execute(&self.pool)
            .await
            .context("failed to update media spoiler preference")?;
        Ok(())
    }

    async fn set_user_state(&self, user_id: &str, state: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .set(Self::user_state_key(user_id), state)
            .await
            .context("failed to set user state")?;
        Ok(())
    }

    async fn get_user_state(&self, user_id: &str) -> Result<Option<String>> {
        let mut conn = self.redis.clone();
        let state: Option<String> = conn
            .get(Self::user_state_key(user_id))
            .await
            .context("failed to get user state")?;
        Ok(state)
    }

    async fn clear_user_state(&self, user_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn
            .del(Self::user_state_key(user_id))
            .await
            .context("failed to clear user state")?;
        Ok(())
    }

    async fn set_attribute(&self, user_id: &str, key: &str, value: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: () = conn
            .set(Self::attribute_key(user_id, key), value)
            .await
            .context("failed to set attribute")?;
        Ok(())
    }

    async fn get_attribute(&self, user_id: &str, key: &str) -> Result<Option<String>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn
            .get(Self::attribute_key(user_id, key))
            .await
            .context("failed to get attribute")?;
        Ok(value)
    }

    async fn delete_attribute(&self, user_id: &str, key: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn
            .del(Self::attribute_key(user_id, key))
            .await
            .context("failed to delete attribute")?;
        Ok(())
    }

    async fn block(&self, blocker_id: &str, blocked_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE users SET blocked_users = array_append(blocked_users, $2) \
             WHERE id = $1 AND NOT ($2 = ANY(blocked_users))",
        )
        .bind(blocker_id)
        .bind(blocked_id)
        .execute(&self.pool)
        .await
        .context("failed to block user")?;
        Ok(())
    }

    async fn unblock(&self, blocker_id: &str, blocked_id: &str) -> Result<()> {
        sqlx::query("UPDATE users SET blocked_users = array_remove(blocked_users, $2) WHERE id = $1")
            .bind(blocker_id)
            .bind(blocked_id)
            .execute(&self.pool)
            .await
            .context("failed to unblock user")?;
        Ok(())
    }

    async fn is_banned(&self, user_id: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        let exists: bool = conn
            .exists(Self::ban_key(user_id))
            .await
            .context("failed to check ban flag")?;
        Ok(exists)
    }

    async fn ban(&self, user_id: &str, duration_secs: u64) -> Result<()> {
        let mut conn = self.redis.clone();
        if duration_secs == 0 {
            let _: () = conn
                .set(Self::ban_key(user_id), "1")
                .await
                .context("failed to set ban flag")?;
        } else {
            let _: () = conn
                .set_ex(Self::ban_key(user_id), "1", duration_secs)
                .await
                .context("failed to set ban flag")?;
        }
        Ok(())
    }

    async fn unban(&self, user_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn
            .del(Self::ban_key(user_id))
            .await
            .context("failed to clear ban flag")?;
        Ok(())
    }

    async fn last_ban_date(&self, user_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT last_ban_date FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to load last ban date")?;
        Ok(row.map(|r| r.get("last_ban_date")).unwrap_or(0))
    }

    async fn save_room(&self, room: &ChatRoom) -> Result<()> {
        // 校验：任一参与者都不得已有活跃房间
        let members = vec![room.user1_id.clone(), room.user2_id.clone()];
        let conflict = sqlx::query(
            "SELECT room_id FROM rooms WHERE is_active \
             AND (user1_id = ANY($1) OR user2_id = ANY($1)) AND room_id != $2 LIMIT 1",
        )
        .bind(&members)
        .bind(&room.room_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to check active room conflict")?;
        if conflict.is_some() {
            bail!("participant already has an active room");
        }

        sqlx::query(
            "INSERT INTO rooms (room_id, user1_id, user2_id, is_active, started_at, ended_at) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (room_id) DO UPDATE SET is_active = EXCLUDED.is_active, \
             ended_at = EXCLUDED.ended_at",
        )
        .bind(&room.room_id)
        .bind(&room.user1_id)
        .bind(&room.user2_id)
        .bind(room.is_active)
        .bind(room.started_at)
        .bind(room.ended_at)
        .execute(&self.pool)
        .await
        .context("failed to save room")?;
        Ok(())
    }

    async fn close_room(&self, room_id: &str) -> Result<()> {
        sqlx::query("UPDATE rooms SET is_active = FALSE, ended_at = NOW() WHERE room_id = $1")
            .bind(room_id)
            .execute(&self.pool)
            .await
            .context("failed to close room")?;
        Ok(())
    }

    async fn get_room_by_id(&self, room_id: &str) -> Result<Option<ChatRoom>> {
        let row = sqlx::query(
            "SELECT room_id, user1_id, user2_id, is_active, started_at, ended_at \
             FROM rooms WHERE room_id = $1",
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load room")?;
        Ok(row.as_ref().map(row_to_room))
    }

    async fn active_room_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT room_id FROM rooms WHERE is_active")
            .fetch_all(&self.pool)
            .await
            .context("failed to list active rooms")?;
        Ok(rows.iter().map(|r| r.get("room_id")).collect())
    }

    async fn active_room_id_for(&self, user_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT room_id FROM rooms WHERE is_active \
             AND (user1_id = $1 OR user2_id = $1) LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to find active room for user")?;
        Ok(row.map(|r| r.get("room_id")))
    }

    async fn save_message(&self, message: &ChatMessage) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO messages (room_id, sender_id, kind, body, caption, reply_to_id, \
             transport_id_sender) VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
        )
        .bind(&message.room_id)
        .bind(&message.sender_id)
        .bind(message.kind.as_str())
        .bind(&message.body)
        .bind(&message.caption)
        .bind(message.reply_to_id)
        .bind(message.transport_id_sender)
        .fetch_one(&self.pool)
        .await
        .context("failed to save message")?;
        Ok(row.get("id"))
    }

    async fn get_history(&self, room_id: &str) -> Result<Vec<MessageRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE room_id = $1 ORDER BY created_at ASC"
        ))
        .bind(room_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load chat history")?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    async fn find_message_by_id(&self, id: i64) -> Result<Option<MessageRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load message by id")?;
        Ok(row.as_ref().map(row_to_message))
    }

    async fn save_transport_id(
        &self,
        history_id: i64,
        user_id: &str,
        transport_msg_id: i64,
    ) -> Result<()> {
        // 按 user_id 是发送方还是接收方决定写入哪个槽位
        sqlx::query(
            "UPDATE messages SET \
             transport_id_sender = CASE WHEN sender_id = $2 THEN $3 ELSE transport_id_sender END, \
             transport_id_receiver = CASE WHEN sender_id != $2 THEN $3 ELSE transport_id_receiver END \
             WHERE id = $1",
        )
        .bind(history_id)
        .bind(user_id)
        .bind(transport_msg_id)
        .execute(&self.pool)
        .await
        .context("failed to save transport message id")?;
        Ok(())
    }

    async fn lookup_history_id_by_transport_id(
        &self,
        transport_msg_id: i64,
    ) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT id FROM messages \
             WHERE transport_id_sender = $1 OR transport_id_receiver = $1 \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(transport_msg_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to resolve transport message id")?;
        Ok(row.map(|r| r.get("id")))
    }

    async fn lookup_history_id_by_transport_id_media(
        &self,
        transport_msg_id: i64,
    ) -> Result<Option<i64>> {
        // 媒体编辑：相同内容（body 即 file id）按最早一条归并，
        // 再从归并结果里取最新的一条
        let row = sqlx::query(
            "SELECT id FROM ( \
                 SELECT DISTINCT ON (body) id, created_at \
                 FROM messages \
                 WHERE transport_id_sender = $1 OR transport_id_receiver = $1 \
                 ORDER BY body, created_at ASC \
             ) AS earliest_groups \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(transport_msg_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to resolve edited media message")?;
        Ok(row.map(|r| r.get("id")))
    }

    async fn lookup_partner_transport_id_for_reply(
        &self,
        history_id: i64,
        current_recipient_id: &str,
    ) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT sender_id, transport_id_sender, transport_id_receiver \
             FROM messages WHERE id = $1",
        )
        .bind(history_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load message for reply resolution")?;
        let Some(row) = row else {
            return Ok(None);
        };
        let sender_id: String = row.get("sender_id");
        if sender_id == current_recipient_id {
            Ok(row.get("transport_id_sender"))
        } else {
            Ok(row.get("transport_id_receiver"))
        }
    }

    async fn save_complaint(&self, complaint: &Complaint) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO complaints (room_id, reporter_id, suspect_id, logged_messages, \
             reason, severity, status) VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
        )
        .bind(&complaint.room_id)
        .bind(&complaint.reporter_id)
        .bind(&complaint.suspect_id)
        .bind(&complaint.logged_messages)
        .bind(&complaint.reason)
        .bind(complaint.severity.as_str())
        .bind(if complaint.status.is_empty() {
            "new"
        } else {
            complaint.status.as_str()
        })
        .fetch_one(&self.pool)
        .await
        .context("failed to save complaint")?;
        Ok(row.get("id"))
    }

    async fn get_complaint_by_id(&self, complaint_id: i64) -> Result<Option<Complaint>> {
        let row = sqlx::query(&format!(
            "SELECT {COMPLAINT_COLUMNS} FROM complaints WHERE id = $1"
        ))
        .bind(complaint_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load complaint")?;
        Ok(row.as_ref().map(row_to_complaint))
    }

    async fn complaints_for_user(
        &self,
        suspect_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Complaint>> {
        let rows = sqlx::query(&format!(
            "SELECT {COMPLAINT_COLUMNS} FROM complaints \
             WHERE suspect_id = $1 AND created_at >= $2"
        ))
        .bind(suspect_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("failed to load complaints for user")?;
        Ok(rows.iter().map(row_to_complaint).collect())
    }

    async fn complaints_by_room_and_suspect(
        &self,
        room_id: &str,
        suspect_id: &str,
    ) -> Result<Vec<Complaint>> {
        let rows = sqlx::query(&format!(
            "SELECT {COMPLAINT_COLUMNS} FROM complaints \
             WHERE room_id = $1 AND suspect_id = $2"
        ))
        .bind(room_id)
        .bind(suspect_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load complaints by room")?;
        Ok(rows.iter().map(row_to_complaint).collect())
    }

    async fn complaints_by_reporter_since(
        &self,
        reporter_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Complaint>> {
        let rows = sqlx::query(&format!(
            "SELECT {COMPLAINT_COLUMNS} FROM complaints \
             WHERE reporter_id = $1 AND created_at >= $2"
        ))
        .bind(reporter_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("failed to load complaints by reporter")?;
        Ok(rows.iter().map(row_to_complaint).collect())
    }

    async fn enqueue_search(&self, user_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn
            .sadd(SEARCH_QUEUE_KEY, user_id)
            .await
            .context("failed to add user to search queue")?;
        Ok(())
    }

    async fn dequeue_search(&self, user_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: i64 = conn
            .srem(SEARCH_QUEUE_KEY, user_id)
            .await
            .context("failed to remove user from search queue")?;
        Ok(())
    }

    async fn list_waiting(&self) -> Result<Vec<String>> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn
            .smembers(SEARCH_QUEUE_KEY)
            .await
            .context("failed to list waiting users")?;
        Ok(members)
    }
}
