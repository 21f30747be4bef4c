//! 会话枢纽
//!
//! 每实例一个单线程事件循环：持有本实例全部活跃会话，分发传输层
//! 入站事件、总线投递、注册 / 注销、会话恢复与关停。会话表只在循环
//! 内部被修改。

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DialogPolicy, HubConfig};
use crate::domain::model::{ChatMessage, ChatRoom, MessageKind, SearchRequest, SystemKey};
use crate::domain::repositories::{RoomBus, Storage};
use crate::domain::service::complaint::ComplaintPipeline;
use crate::domain::session::{ChatSession, try_enqueue};

/// 会话恢复回调
///
/// 由传输层提供：为给定用户构造一个已经预填 `room_id` 的会话。
/// 枢纽负责注册并启动返回的会话。
pub type SessionRestorer = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<Arc<dyn ChatSession>>> + Send>>
        + Send
        + Sync,
>;

/// 匹配器产生的建房事件
#[derive(Debug)]
pub struct RoomCreated {
    pub room_id: String,
    pub user1_id: String,
    pub user2_id: String,
}

/// 会话恢复请求；回执 true 表示会话可用（或无需恢复）
pub struct RestoreRequest {
    pub user_id: String,
    pub reply: oneshot::Sender<bool>,
}

/// 枢纽句柄
///
/// 传输层与匹配器只通过它与枢纽通信，不接触会话表。
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Arc<dyn ChatSession>>,
    unregister_tx: mpsc::Sender<Arc<dyn ChatSession>>,
    incoming_tx: mpsc::Sender<ChatMessage>,
    restore_tx: mpsc::Sender<RestoreRequest>,
    room_tx: mpsc::Sender<RoomCreated>,
}

impl HubHandle {
    /// 注册会话；传输层必须在推送第一条入站消息之前调用
    pub async fn register(&self, session: Arc<dyn ChatSession>) -> Result<()> {
        self.register_tx
            .send(session)
            .await
            .context("hub register inbox closed")
    }

    /// 注销会话；断开连接时由传输层调用
    pub async fn unregister(&self, session: Arc<dyn ChatSession>) -> Result<()> {
        self.unregister_tx
            .send(session)
            .await
            .context("hub unregister inbox closed")
    }

    /// 推送一条入站消息
    pub async fn incoming(&self, message: ChatMessage) -> Result<()> {
        self.incoming_tx
            .send(message)
            .await
            .context("hub incoming inbox closed")
    }

    /// 请求恢复某用户的会话；返回会话是否可用
    pub async fn restore_session(&self, user_id: &str) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = RestoreRequest {
            user_id: user_id.to_string(),
            reply: reply_tx,
        };
        if self.restore_tx.send(request).await.is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// 匹配器通知枢纽：新房间已持久化
    pub async fn room_created(
        &self,
        room_id: String,
        user1_id: String,
        user2_id: String,
    ) -> Result<()> {
        self.room_tx
            .send(RoomCreated {
                room_id,
                user1_id,
                user2_id,
            })
            .await
            .context("hub room inbox closed")
    }
}

/// 枢纽收件箱集合，`run` 启动时一次性取出
struct Inboxes {
    register_rx: mpsc::Receiver<Arc<dyn ChatSession>>,
    unregister_rx: mpsc::Receiver<Arc<dyn ChatSession>>,
    incoming_rx: mpsc::Receiver<ChatMessage>,
    restore_rx: mpsc::Receiver<RestoreRequest>,
    room_rx: mpsc::Receiver<RoomCreated>,
    bus_rx: mpsc::Receiver<ChatMessage>,
}

/// 会话枢纽
pub struct ChatHub {
    sessions: HashMap<String, Arc<dyn ChatSession>>,
    storage: Arc<dyn Storage>,
    bus: Arc<dyn RoomBus>,
    config: Arc<HubConfig>,
    match_tx: mpsc::Sender<SearchRequest>,
    bus_tx: mpsc::Sender<ChatMessage>,
    complaints: Option<Arc<dyn ComplaintPipeline>>,
    restorer: Option<SessionRestorer>,
    cancel: CancellationToken,
    inboxes: Option<Inboxes>,
}

impl ChatHub {
    /// 创建枢纽
    ///
    /// 返回枢纽本体、供外部使用的句柄，以及匹配请求的接收端
    /// （交给匹配器）。
    pub fn new(
        storage: Arc<dyn Storage>,
        bus: Arc<dyn RoomBus>,
        config: Arc<HubConfig>,
        cancel: CancellationToken,
    ) -> (Self, HubHandle, mpsc::Receiver<SearchRequest>) {
        let depth = config.hub_inbox_depth;
        let (register_tx, register_rx) = mpsc::channel(depth);
        let (unregister_tx, unregister_rx) = mpsc::channel(depth);
        let (incoming_tx, incoming_rx) = mpsc::channel(depth);
        let (restore_tx, restore_rx) = mpsc::channel(depth);
        let (room_tx, room_rx) = mpsc::channel(depth);
        let (bus_tx, bus_rx) = mpsc::channel(depth);
        let (match_tx, match_rx) = mpsc::channel(depth);

        let hub = Self {
            sessions: HashMap::new(),
            storage,
            bus,
            config,
            match_tx,
            bus_tx,
            complaints: None,
            restorer: None,
            cancel,
            inboxes: Some(Inboxes {
                register_rx,
                unregister_rx,
                incoming_rx,
                restore_rx,
                room_rx,
                bus_rx,
            }),
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            incoming_tx,
            restore_tx,
            room_tx,
        };
        (hub, handle, match_rx)
    }

    /// 设置会话恢复回调
    pub fn set_restorer(&mut self, restorer: SessionRestorer) {
        self.restorer = Some(restorer);
    }

    /// 设置投诉管道
    pub fn set_complaint_pipeline(&mut self, pipeline: Arc<dyn ComplaintPipeline>) {
        self.complaints = Some(pipeline);
    }

    /// 运行事件循环
    ///
    /// 启动总线订阅任务、执行房间恢复，然后逐事件处理直到取消。
    pub async fn run(mut self) -> Result<()> {
        info!("chat hub started");

        self.start_bus_subscriber().await?;
        self.recover_rooms().await;

        let Inboxes {
            mut register_rx,
            mut unregister_rx,
            mut incoming_rx,
            mut restore_rx,
            mut room_rx,
            mut bus_rx,
        } = self.inboxes.take().expect("hub inboxes already taken");
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(session) = register_rx.recv() => self.handle_register(session),
                Some(session) = unregister_rx.recv() => self.handle_unregister(session),
                Some(message) = incoming_rx.recv() => self.handle_incoming(message).await,
                Some(message) = bus_rx.recv() => self.handle_bus_message(message).await,
                Some(request) = restore_rx.recv() => self.handle_restore(request).await,
                Some(event) = room_rx.recv() => self.handle_room_created(event),
                else => break,
            }
        }

        // 关停：不再接收新事件，清空 incoming，关闭所有会话出站队列
        incoming_rx.close();
        while let Ok(message) = incoming_rx.try_recv() {
            self.handle_incoming(message).await;
        }
        for (_, session) in self.sessions.drain() {
            session.close();
        }
        info!("chat hub stopped");
        Ok(())
    }

    /// 启动总线订阅任务：反序列化总线帧并转入 bus 收件箱
    async fn start_bus_subscriber(&self) -> Result<()> {
        let mut subscription = self
            .bus
            .subscribe_all()
            .await
            .context("failed to subscribe to room bus")?;
        let bus_tx = self.bus_tx.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = subscription.recv() => match frame {
                        Some(frame) => match frame.decode() {
                            Ok(message) => {
                                if bus_tx.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(channel = %frame.channel, error = %err, "failed to decode bus frame");
                            }
                        },
                        None => break,
                    },
                }
            }
            subscription.close();
            debug!("bus subscriber stopped");
        });
        Ok(())
    }

    /// 启动时读取持久化中的活跃房间
    ///
    /// 会话恢复本身由传输层在用户重连时逐个触发，这里只记录现状。
    async fn recover_rooms(&self) {
        let room_ids = match self.storage.active_room_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "failed to retrieve active rooms from storage");
                return;
            }
        };

        for room_id in &room_ids {
            match self.storage.get_room_by_id(room_id).await {
                Ok(Some(room)) => {
                    info!(
                        room_id = %room.room_id,
                        user1 = %room.user1_id,
                        user2 = %room.user2_id,
                        "restored active room"
                    );
                }
                Ok(None) => warn!(%room_id, "active room id without room row, skipping"),
                Err(err) => warn!(%room_id, error = %err, "failed to load active room"),
            }
        }
        info!(count = room_ids.len(), "room recovery complete");
    }

    fn handle_register(&mut self, session: Arc<dyn ChatSession>) {
        let user_id = session.user_id().to_string();
        if self.sessions.contains_key(&user_id) {
            // 重连：提示新会话后替换槽位
            let notice = ChatMessage::system(&session.room_id(), SystemKey::Reconnect);
            if let Err(err) = try_enqueue(session.as_ref(), notice) {
                warn!(%user_id, error = %err, "failed to deliver reconnect notice");
            }
        }
        self.sessions.insert(user_id.clone(), session);
        info!(%user_id, "session registered");
    }

    fn handle_unregister(&mut self, session: Arc<dyn ChatSession>) {
        let user_id = session.user_id();
        let same = self
            .sessions
            .get(user_id)
            .map(|existing| Arc::ptr_eq(existing, &session))
            .unwrap_or(false);

        // 槽位可能已被更新的会话顶替，此时忽略
        if same {
            self.sessions.remove(user_id);
            session.close();
            info!(%user_id, "session unregistered");
        }
    }

    async fn handle_incoming(&mut self, message: ChatMessage) {
        match message.kind {
            MessageKind::CommandStart | MessageKind::CommandSearch => {
                self.handle_search_command(&message).await;
            }
            MessageKind::CommandStop => {
                self.handle_stop_command(&message, false).await;
            }
            MessageKind::CommandNext => {
                self.handle_stop_command(&message, true).await;
            }
            MessageKind::CommandReport => {
                self.handle_report(&message).await;
            }
            kind if kind.is_content() => {
                self.handle_content(message).await;
            }
            kind => {
                warn!(
                    kind = kind.as_str(),
                    sender_id = %message.sender_id,
                    "dropping message with unroutable kind"
                );
            }
        }
    }

    /// `command_start` / `command_search`：转发匹配请求
    async fn handle_search_command(&self, message: &ChatMessage) {
        let room_id = self
            .sessions
            .get(&message.sender_id)
            .map(|s| s.room_id())
            .unwrap_or_default();

        if !room_id.is_empty() {
            self.notify(&message.sender_id, &room_id, SystemKey::AlreadyInChat);
            return;
        }

        if let Err(err) = self
            .match_tx
            .send(SearchRequest::new(&message.sender_id))
            .await
        {
            warn!(sender_id = %message.sender_id, error = %err, "failed to forward search request");
            return;
        }
        self.notify(&message.sender_id, "", SystemKey::SearchStart);
    }

    /// `command_stop` / `command_next`：关闭房间，评估对话质量
    async fn handle_stop_command(&mut self, message: &ChatMessage, requeue: bool) {
        let room_id = if !message.room_id.is_empty() {
            message.room_id.clone()
        } else {
            self.sessions
                .get(&message.sender_id)
                .map(|s| s.room_id())
                .unwrap_or_default()
        };
        if room_id.is_empty() {
            debug!(sender_id = %message.sender_id, "stop command without active room");
            return;
        }

        let room = match self.storage.get_room_by_id(&room_id).await {
            Ok(Some(room)) => room,
            Ok(None) => {
                warn!(%room_id, "room not found for stop command");
                return;
            }
            Err(err) => {
                warn!(%room_id, error = %err, "failed to load room for stop command");
                return;
            }
        };
        let Some(partner_id) = room.partner_of(&message.sender_id).map(str::to_string) else {
            warn!(%room_id, sender_id = %message.sender_id, "stop command from non-member");
            return;
        };

        self.notify(&message.sender_id, &room_id, SystemKey::StopSelf);

        // stop_partner 经总线发布，由持有对端会话的实例投递
        let mut notice = ChatMessage::system(&room_id, SystemKey::StopPartner);
        notice.sender_id = message.sender_id.clone();
        self.publish(&room_id, &notice).await;

        if let Err(err) = self.storage.close_room(&room_id).await {
            warn!(%room_id, error = %err, "failed to close room");
        }

        if let Some(session) = self.sessions.get(&message.sender_id) {
            session.set_room_id("");
        }
        if let Some(session) = self.sessions.get(&partner_id) {
            session.set_room_id("");
        }

        if requeue {
            if let Err(err) = self
                .match_tx
                .send(SearchRequest::new(&message.sender_id))
                .await
            {
                warn!(sender_id = %message.sender_id, error = %err, "failed to requeue after next");
            }
        }

        self.spawn_quality_evaluation(room, message.sender_id.clone());
    }

    /// `command_report`：转交投诉管道，绝不转发给对端
    async fn handle_report(&self, message: &ChatMessage) {
        match &self.complaints {
            Some(pipeline) => {
                if let Err(err) = pipeline.report(message).await {
                    warn!(sender_id = %message.sender_id, error = %err, "complaint pipeline failed");
                }
            }
            None => {
                debug!(sender_id = %message.sender_id, "complaint pipeline not configured, dropping report");
            }
        }
    }

    /// 常规内容：先落库，后发布
    async fn handle_content(&self, mut message: ChatMessage) {
        if message.room_id.is_empty() {
            self.notify(&message.sender_id, "", SystemKey::NotInChat);
            return;
        }

        match self.storage.save_message(&message).await {
            Ok(id) => message.id = id,
            Err(err) => {
                // 保存失败时跳过发布，向发送方回执错误
                warn!(
                    room_id = %message.room_id,
                    sender_id = %message.sender_id,
                    error = %err,
                    "failed to save message"
                );
                self.notify(&message.sender_id, &message.room_id, SystemKey::Error);
                return;
            }
        }

        let room_id = message.room_id.clone();
        self.publish(&room_id, &message).await;
    }

    /// 总线投递：找出接收方并非阻塞入队
    async fn handle_bus_message(&mut self, message: ChatMessage) {
        let room = match self.storage.get_room_by_id(&message.room_id).await {
            Ok(Some(room)) => room,
            Ok(None) => {
                warn!(room_id = %message.room_id, "room not found for bus message");
                return;
            }
            Err(err) => {
                warn!(room_id = %message.room_id, error = %err, "failed to load room for bus message");
                return;
            }
        };
        let Some(recipient_id) = room.partner_of(&message.sender_id).map(str::to_string) else {
            warn!(room_id = %message.room_id, sender_id = %message.sender_id, "bus message from non-member");
            return;
        };

        // 对端实例收到 stop_partner 时同步清除本地房间指派
        if message.kind == MessageKind::System && message.body == SystemKey::StopPartner.as_str() {
            if let Some(session) = self.sessions.get(&recipient_id) {
                session.set_room_id("");
            }
        }

        if let Some(session) = self.sessions.get(&recipient_id) {
            if let Err(err) = try_enqueue(session.as_ref(), message) {
                // 队列满：丢弃但保持会话存活
                warn!(user_id = %recipient_id, error = %err, "bus message dropped");
            }
        }
    }

    /// 匹配器请求的会话恢复
    async fn handle_restore(&mut self, request: RestoreRequest) {
        let RestoreRequest { user_id, reply } = request;

        if self.sessions.contains_key(&user_id) {
            let _ = reply.send(true);
            return;
        }
        let Some(restorer) = self.restorer.clone() else {
            // 未配置恢复回调时保留队列项
            let _ = reply.send(true);
            return;
        };

        match restorer(user_id.clone()).await {
            Ok(session) => {
                Arc::clone(&session).start();
                self.sessions.insert(user_id.clone(), session);
                info!(%user_id, "session restored");
                let _ = reply.send(true);
            }
            Err(err) => {
                warn!(%user_id, error = %err, "failed to restore session");
                let _ = reply.send(false);
            }
        }
    }

    /// 新房间建立：指派房间并向双方投递 match_found
    fn handle_room_created(&mut self, event: RoomCreated) {
        let RoomCreated {
            room_id,
            user1_id,
            user2_id,
        } = event;

        for user_id in [&user1_id, &user2_id] {
            if let Some(session) = self.sessions.get(user_id.as_str()) {
                session.set_room_id(&room_id);
                if let Err(err) =
                    try_enqueue(session.as_ref(), ChatMessage::system(&room_id, SystemKey::MatchFound))
                {
                    warn!(%user_id, error = %err, "failed to deliver match notification");
                }
            }
        }
        info!(%room_id, user1 = %user1_id, user2 = %user2_id, "match established");
    }

    /// 向本地会话投递系统消息
    fn notify(&self, user_id: &str, room_id: &str, key: SystemKey) {
        if let Some(session) = self.sessions.get(user_id) {
            if let Err(err) = try_enqueue(session.as_ref(), ChatMessage::system(room_id, key)) {
                warn!(%user_id, error = %err, "failed to enqueue system message");
            }
        }
    }

    /// 序列化并发布到房间频道
    async fn publish(&self, room_id: &str, message: &ChatMessage) {
        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%room_id, error = %err, "failed to serialize message for bus");
                return;
            }
        };
        if let Err(err) = self.bus.publish(room_id, &payload).await {
            warn!(%room_id, error = %err, "failed to publish message");
        }
    }

    /// 对话质量评估
    ///
    /// 历史扫描属于重查询，放到一次性任务中执行，结果直接写回存储。
    fn spawn_quality_evaluation(&self, room: ChatRoom, initiator: String) {
        let storage = Arc::clone(&self.storage);
        let policy = self.config.dialog;
        tokio::spawn(async move {
            if let Err(err) =
                evaluate_dialog_quality(storage.as_ref(), &policy, &room, &initiator).await
            {
                warn!(room_id = %room.room_id, error = %err, "dialog quality evaluation failed");
            }
        });
    }
}

/// 房间关闭时的对话质量启发式
///
/// 任一方在房间存续期内被投诉时不做任何调整。时长达标且双方消息数
/// 达标时双方加分；过早挂断且对方消息数不足时仅扣发起方。
pub(crate) async fn evaluate_dialog_quality(
    storage: &dyn Storage,
    policy: &DialogPolicy,
    room: &ChatRoom,
    initiator: &str,
) -> Result<()> {
    let complaints1 = storage
        .complaints_for_user(&room.user1_id, room.started_at)
        .await?;
    let complaints2 = storage
        .complaints_for_user(&room.user2_id, room.started_at)
        .await?;
    if !complaints1.is_empty() || !complaints2.is_empty() {
        return Ok(());
    }

    let history = storage.get_history(&room.room_id).await?;
    let elapsed = Utc::now()
        .signed_duration_since(room.started_at)
        .to_std()
        .unwrap_or_default();

    if elapsed >= policy.successful_duration {
        let user1_messages = history
            .iter()
            .filter(|m| m.sender_id == room.user1_id)
            .count();
        let user2_messages = history.len() - user1_messages;
        if user1_messages >= policy.successful_messages
            && user2_messages >= policy.successful_messages
        {
            storage
                .update_reputation(&room.user1_id, policy.successful_reward)
                .await?;
            storage
                .update_reputation(&room.user2_id, policy.successful_reward)
                .await?;
            info!(room_id = %room.room_id, "successful dialog, both parties rewarded");
        }
    } else if elapsed < policy.early_disconnect_duration {
        let Some(partner_id) = room.partner_of(initiator) else {
            return Ok(());
        };
        let partner_messages = history.iter().filter(|m| m.sender_id == partner_id).count();
        if partner_messages < policy.early_disconnect_messages {
            storage
                .update_reputation(initiator, policy.early_disconnect_penalty)
                .await?;
            info!(room_id = %room.room_id, %initiator, "early disconnect, initiator penalized");
        }
    }
    Ok(())
}
