use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 系统用户
///
/// 首次接触时惰性创建，永不删除。
#[derive(Clone, Debug, Default)]
pub struct User {
    /// 内部匿名 ID（UUID）
    pub id: String,
    /// 传输层身份（如 bot 平台的 chat id），可以为空
    pub external_id: Option<i64>,
    /// 界面语言
    pub language: String,
    /// 被本用户拉黑的用户 ID 列表
    pub blocked_users: Vec<String>,
    /// 是否处于封禁状态
    pub is_blocked: bool,
    /// 封禁截止时间（unix 秒，0 表示未封禁）
    pub block_end_time: i64,
    /// 封禁等级（用于递进封禁时长）
    pub block_level: i32,
    /// 最近一次封禁时间（unix 秒）
    pub last_ban_date: i64,
    /// 声誉分，范围 0..=1000
    pub reputation: i32,
    /// 本用户发送的媒体默认是否带遮罩
    pub media_spoiler: bool,
}

/// 初始声誉分
pub const INITIAL_REPUTATION: i32 = 1000;
/// 声誉分上限
pub const MAX_REPUTATION: i32 = 1000;
/// 声誉分下限
pub const MIN_REPUTATION: i32 = 0;

impl User {
    pub fn new(id: String, external_id: Option<i64>) -> Self {
        Self {
            id,
            external_id,
            language: "en".to_string(),
            reputation: INITIAL_REPUTATION,
            media_spoiler: true,
            ..Default::default()
        }
    }

    /// 用户是否拉黑了 `other`
    pub fn has_blocked(&self, other: &str) -> bool {
        self.blocked_users.iter().any(|id| id == other)
    }
}

/// 1 对 1 聊天房间
///
/// 不变式：同一时刻任一用户至多属于一个活跃房间。
#[derive(Clone, Debug)]
pub struct ChatRoom {
    pub room_id: String,
    pub user1_id: String,
    pub user2_id: String,
    pub is_active: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ChatRoom {
    pub fn new(room_id: String, user1_id: String, user2_id: String) -> Self {
        Self {
            room_id,
            user1_id,
            user2_id,
            is_active: true,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// 返回房间里另一个参与者；`user_id` 不是成员时返回 None
    pub fn partner_of(&self, user_id: &str) -> Option<&str> {
        if user_id == self.user1_id {
            Some(&self.user2_id)
        } else if user_id == self.user2_id {
            Some(&self.user1_id)
        } else {
            None
        }
    }
}

/// 持久化的消息行
///
/// 除两个传输侧 ID 槽位外不可变。
#[derive(Clone, Debug)]
pub struct MessageRecord {
    /// 存储分配的单调递增 ID
    pub id: i64,
    pub room_id: String,
    pub sender_id: String,
    pub kind: MessageKind,
    pub body: String,
    pub caption: String,
    pub reply_to_id: Option<i64>,
    /// 发送方传输侧消息 ID
    pub transport_id_sender: Option<i64>,
    /// 接收方传输侧消息 ID，投递回执后填入
    pub transport_id_receiver: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// 实时消息（内存 / 总线线格式）
///
/// 经由枢纽路由并以 JSON 形式发布到总线。
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    /// 消息 ID，保存后由存储填入；0 表示尚未保存
    #[serde(default, skip_serializing_if = "id_is_zero")]
    pub id: i64,
    pub sender_id: String,
    pub room_id: String,
    pub kind: MessageKind,
    /// 消息主体（文本，或媒体的 file id）
    pub body: String,
    /// 附加说明（如媒体的 caption）
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub caption: String,
    /// 被回复消息的内部 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<i64>,
    /// 发送方传输侧消息 ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_id_sender: Option<i64>,
}

fn id_is_zero(id: &i64) -> bool {
    *id == 0
}

impl ChatMessage {
    pub fn content(sender_id: &str, room_id: &str, kind: MessageKind, body: &str) -> Self {
        Self {
            id: 0,
            sender_id: sender_id.to_string(),
            room_id: room_id.to_string(),
            kind,
            body: body.to_string(),
            caption: String::new(),
            reply_to_id: None,
            transport_id_sender: None,
        }
    }

    /// 构造一条系统消息；body 携带目录键，由传输层做本地化
    pub fn system(room_id: &str, key: SystemKey) -> Self {
        Self {
            id: 0,
            sender_id: "system".to_string(),
            room_id: room_id.to_string(),
            kind: MessageKind::System,
            body: key.as_str().to_string(),
            caption: String::new(),
            reply_to_id: None,
            transport_id_sender: None,
        }
    }
}

/// 消息种类标签
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Photo,
    Video,
    Sticker,
    Voice,
    Animation,
    VideoNote,
    Reply,
    Edit,
    CommandStart,
    CommandSearch,
    CommandStop,
    CommandNext,
    CommandReport,
    System,
    /// 未知标签：记录日志后丢弃
    #[serde(other)]
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Photo => "photo",
            MessageKind::Video => "video",
            MessageKind::Sticker => "sticker",
            MessageKind::Voice => "voice",
            MessageKind::Animation => "animation",
            MessageKind::VideoNote => "video_note",
            MessageKind::Reply => "reply",
            MessageKind::Edit => "edit",
            MessageKind::CommandStart => "command_start",
            MessageKind::CommandSearch => "command_search",
            MessageKind::CommandStop => "command_stop",
            MessageKind::CommandNext => "command_next",
            MessageKind::CommandReport => "command_report",
            MessageKind::System => "system",
            MessageKind::Unknown => "unknown",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "text" => MessageKind::Text,
            "photo" => MessageKind::Photo,
            "video" => MessageKind::Video,
            "sticker" => MessageKind::Sticker,
            "voice" => MessageKind::Voice,
            "animation" => MessageKind::Animation,
            "video_note" => MessageKind::VideoNote,
            "reply" => MessageKind::Reply,
            "edit" => MessageKind::Edit,
            "command_start" => MessageKind::CommandStart,
            "command_search" => MessageKind::CommandSearch,
            "command_stop" => MessageKind::CommandStop,
            "command_next" => MessageKind::CommandNext,
            "command_report" => MessageKind::CommandReport,
            "system" => MessageKind::System,
            _ => MessageKind::Unknown,
        }
    }

    /// 是否为命令类消息
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            MessageKind::CommandStart
                | MessageKind::CommandSearch
                | MessageKind::CommandStop
                | MessageKind::CommandNext
                | MessageKind::CommandReport
        )
    }

    /// 是否为常规内容（进入存储 + 总线路由路径）
    pub fn is_content(&self) -> bool {
        matches!(
            self,
            MessageKind::Text
                | MessageKind::Photo
                | MessageKind::Video
                | MessageKind::Sticker
                | MessageKind::Voice
                | MessageKind::Animation
                | MessageKind::VideoNote
                | MessageKind::Reply
                | MessageKind::Edit
        )
    }
}

/// 枢纽可向会话出站队列发出的系统消息目录
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemKey {
    Reconnect,
    SearchStart,
    MatchFound,
    StopSelf,
    StopPartner,
    AlreadyInChat,
    NotInChat,
    Info,
    Error,
}

impl SystemKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemKey::Reconnect => "reconnect",
            SystemKey::SearchStart => "search_start",
            SystemKey::MatchFound => "match_found",
            SystemKey::StopSelf => "stop_self",
            SystemKey::StopPartner => "stop_partner",
            SystemKey::AlreadyInChat => "already_in_chat",
            SystemKey::NotInChat => "not_in_chat",
            SystemKey::Info => "info",
            SystemKey::Error => "error",
        }
    }
}

/// 投诉记录
#[derive(Clone, Debug)]
pub struct Complaint {
    pub id: i64,
    pub room_id: String,
    pub reporter_id: String,
    pub suspect_id: String,
    /// 相关聊天记录（JSON 字符串）
    pub logged_messages: String,
    pub reason: String,
    pub severity: ComplaintSeverity,
    /// 状态（new / under_review / confirmed）
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// 投诉严重程度
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComplaintSeverity {
    Low,
    Medium,
    Critical,
}

impl ComplaintSeverity {
    /// 对应的声誉扣分权重
    pub fn weight(&self) -> i32 {
        match self {
            ComplaintSeverity::Low => 5,
            ComplaintSeverity::Medium => 50,
            ComplaintSeverity::Critical => 250,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComplaintSeverity::Low => "low",
            ComplaintSeverity::Medium => "medium",
            ComplaintSeverity::Critical => "critical",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "medium" => ComplaintSeverity::Medium,
            "critical" => ComplaintSeverity::Critical,
            _ => ComplaintSeverity::Low,
        }
    }
}

/// 匹配请求
#[derive(Clone, Debug, Default)]
pub struct SearchRequest {
    pub user_id: String,
    pub params: SearchParams,
}

impl SearchRequest {
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ..Default::default()
        }
    }
}

/// 匹配过滤参数（扩展点：当前策略只做拉黑排除）
#[derive(Clone, Debug, Default)]
pub struct SearchParams {
    pub target_gender: Option<String>,
    pub age_min: Option<u32>,
    pub age_max: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试：线格式字段与种类标签的序列化形式
    #[test]
    fn chat_message_wire_format() {
        let mut msg = ChatMessage::content("u1", "r1", MessageKind::Text, "hi");
        msg.id = 42;

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"text\""));
        assert!(json.contains("\"id\":42"));
        assert!(json.contains("\"sender_id\":\"u1\""));
        // 空 caption 不应出现在线格式中
        assert!(!json.contains("caption"));

        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    /// 测试：未保存的消息（id == 0）不序列化 id 字段
    #[test]
    fn unsaved_message_omits_id() {
        let msg = ChatMessage::content("u1", "r1", MessageKind::Text, "hi");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("\"id\""));

        let back: ChatMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 0);
    }

    /// 测试：未知种类标签反序列化为 Unknown
    #[test]
    fn unknown_kind_deserializes_to_unknown() {
        let json = r#"{"sender_id":"u1","room_id":"r1","kind":"typing","body":""}"#;
        let msg: ChatMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.kind, MessageKind::Unknown);
    }

    /// 测试：command_search 是独立标签但属于命令类
    #[test]
    fn kind_classification() {
        assert!(MessageKind::CommandSearch.is_command());
        assert!(MessageKind::CommandStart.is_command());
        assert!(MessageKind::Text.is_content());
        assert!(MessageKind::VideoNote.is_content());
        assert!(!MessageKind::System.is_content());
        assert!(!MessageKind::Unknown.is_content());
        assert_eq!(MessageKind::from_str("video_note"), MessageKind::VideoNote);
        assert_eq!(MessageKind::from_str("nonsense"), MessageKind::Unknown);
    }

    #[test]
    fn partner_of_resolves_both_sides() {
        let room = ChatRoom::new("r".into(), "a".into(), "b".into());
        assert_eq!(room.partner_of("a"), Some("b"));
        assert_eq!(room.partner_of("b"), Some("a"));
        assert_eq!(room.partner_of("c"), None);
    }
}
