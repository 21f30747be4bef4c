//! 投诉处理服务
//!
//! 枢纽把举报事件转交给这里：登记投诉、按严重程度扣减被举报方
//! 声誉、必要时施加递进封禁。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::domain::model::{ChatMessage, Complaint, ComplaintSeverity, User};
use crate::domain::repositories::Storage;

/// 声誉低于该阈值即触发封禁
const BAN_THRESHOLD_REPUTATION: i32 = 500;
/// 时间窗内投诉数超过该阈值即触发封禁
const BAN_THRESHOLD_FREQUENCY: usize = 5;
/// 频次封禁的统计窗口
const BAN_FREQUENCY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);
/// 各级封禁时长
const BAN_LEVEL1_DURATION: Duration = Duration::from_secs(30 * 60);
const BAN_LEVEL2_DURATION: Duration = Duration::from_secs(6 * 60 * 60);
const BAN_LEVEL3_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
/// 投诉被确认时举报方获得的声誉奖励
const CONFIRMED_COMPLAINT_BONUS: i32 = 50;
/// 同一举报方一小时内重复举报的权重衰减系数
const REPORTER_DECAY: f64 = 0.75;
/// 附在投诉里的聊天记录条数上限
const LOGGED_MESSAGE_LIMIT: usize = 20;

/// 投诉管道接口
///
/// 枢纽只依赖这个窄接口转发 `command_report` 事件。
#[async_trait]
pub trait ComplaintPipeline: Send + Sync {
    async fn report(&self, message: &ChatMessage) -> Result<()>;
}

/// 投诉处理服务
pub struct ComplaintService {
    storage: Arc<dyn Storage>,
}

impl ComplaintService {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// 处理一条已登记的投诉
    ///
    /// 同一房间针对同一嫌疑人的重复投诉不再追加惩罚；同一举报方
    /// 一小时内的连续举报按 0.75 的系数衰减权重，下限为 1。
    pub async fn handle_complaint(&self, complaint: &Complaint) -> Result<()> {
        let existing = self
            .storage
            .complaints_by_room_and_suspect(&complaint.room_id, &complaint.suspect_id)
            .await?;
        if existing.iter().filter(|c| c.id != complaint.id).count() >= 1 {
            return Ok(());
        }

        let since = Utc::now() - chrono::Duration::hours(1);
        let recent = self
            .storage
            .complaints_by_reporter_since(&complaint.reporter_id, since)
            .await?;
        let repeat_count = recent.iter().filter(|c| c.id != complaint.id).count();

        let mut weight = complaint.severity.weight() as f64;
        for _ in 0..repeat_count {
            weight *= REPORTER_DECAY;
        }
        let final_weight = (weight as i32).max(1);

        self.storage
            .update_reputation(&complaint.suspect_id, -final_weight)
            .await?;
        info!(
            suspect_id = %complaint.suspect_id,
            penalty = final_weight,
            severity = complaint.severity.as_str(),
            "complaint penalty applied"
        );

        self.check_for_ban(&complaint.suspect_id).await
    }

    /// 检查用户是否达到封禁条件（声誉阈值或投诉频次）
    pub async fn check_for_ban(&self, user_id: &str) -> Result<()> {
        let Some(user) = self.storage.get_user_by_id(user_id).await? else {
            return Ok(());
        };

        if user.reputation < BAN_THRESHOLD_REPUTATION {
            return self.apply_ban(user).await;
        }

        let window_start =
            Utc::now() - chrono::Duration::from_std(BAN_FREQUENCY_WINDOW).unwrap_or_default();
        let complaints = self
            .storage
            .complaints_for_user(user_id, window_start)
            .await?;
        if complaints.len() > BAN_THRESHOLD_FREQUENCY {
            return self.apply_ban(user).await;
        }
        Ok(())
    }

    /// 管理端确认投诉：举报方获得声誉奖励
    pub async fn confirm_complaint(&self, complaint_id: i64) -> Result<bool> {
        let Some(complaint) = self.storage.get_complaint_by_id(complaint_id).await? else {
            return Ok(false);
        };
        self.storage
            .update_reputation(&complaint.reporter_id, CONFIRMED_COMPLAINT_BONUS)
            .await?;
        Ok(true)
    }

    /// 施加封禁，时长按最近一次封禁的间隔递进
    async fn apply_ban(&self, mut user: User) -> Result<()> {
        let last_ban = self.storage.last_ban_date(&user.id).await?;

        let mut level = 1;
        if last_ban > 0 {
            let since_last = Utc::now().timestamp() - last_ban;
            if since_last < 7 * 24 * 60 * 60 {
                level = 2;
            } else if since_last < 30 * 24 * 60 * 60 {
                level = 3;
            }
        }
        let duration = ban_duration(level);

        let now = Utc::now().timestamp();
        user.is_blocked = true;
        user.block_end_time = now + duration.as_secs() as i64;
        user.block_level = level;
        user.last_ban_date = now;
        self.storage.update_user(&user).await?;
        self.storage.ban(&user.id, duration.as_secs()).await?;

        info!(user_id = %user.id, level, "user banned");
        Ok(())
    }
}

fn ban_duration(level: i32) -> Duration {
    match level {
        1 => BAN_LEVEL1_DURATION,
        2 => BAN_LEVEL2_DURATION,
        _ => BAN_LEVEL3_DURATION,
    }
}

#[async_trait]
impl ComplaintPipeline for ComplaintService {
    /// 由举报消息登记投诉并进入处理流程
    ///
    /// 严重程度由传输层放在 caption 里，举报理由在 body 里。
    async fn report(&self, message: &ChatMessage) -> Result<()> {
        if message.room_id.is_empty() {
            warn!(sender_id = %message.sender_id, "report without active room, ignored");
            return Ok(());
        }
        let Some(room) = self.storage.get_room_by_id(&message.room_id).await? else {
            warn!(room_id = %message.room_id, "report references unknown room, ignored");
            return Ok(());
        };
        let Some(suspect_id) = room.partner_of(&message.sender_id).map(str::to_string) else {
            warn!(room_id = %message.room_id, sender_id = %message.sender_id, "report from non-member, ignored");
            return Ok(());
        };

        let history = self.storage.get_history(&message.room_id).await?;
        let logged: Vec<serde_json::Value> = history
            .iter()
            .rev()
            .take(LOGGED_MESSAGE_LIMIT)
            .map(|record| {
                json!({
                    "id": record.id,
                    "sender_id": record.sender_id,
                    "kind": record.kind.as_str(),
                    "body": record.body,
                })
            })
            .collect();

        let mut complaint = Complaint {
            id: 0,
            room_id: message.room_id.clone(),
            reporter_id: message.sender_id.clone(),
            suspect_id,
            logged_messages: serde_json::to_string(&logged)?,
            reason: message.body.clone(),
            severity: ComplaintSeverity::from_str(&message.caption),
            status: "new".to_string(),
            created_at: Utc::now(),
        };
        complaint.id = self.storage.save_complaint(&complaint).await?;

        self.handle_complaint(&complaint).await
    }
}
