//! 匹配服务
//!
//! 持有等待队列，消费匹配请求，产出建房事件。队列同时镜像到持久化
//! 端口，重启后可恢复。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::model::{ChatRoom, SearchRequest, User};
use crate::domain::repositories::Storage;
use crate::domain::service::hub::HubHandle;

/// 收件箱空闲多久后对整个队列做一轮补配，两轮之间也以此间隔退避
const IDLE_PASS_INTERVAL: Duration = Duration::from_millis(100);

/// 匹配服务
pub struct MatcherService {
    queue: HashMap<String, SearchRequest>,
    storage: Arc<dyn Storage>,
    hub: HubHandle,
    match_rx: Option<mpsc::Receiver<SearchRequest>>,
    cancel: CancellationToken,
}

impl MatcherService {
    pub fn new(
        storage: Arc<dyn Storage>,
        hub: HubHandle,
        match_rx: mpsc::Receiver<SearchRequest>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue: HashMap::new(),
            storage,
            hub,
            match_rx: Some(match_rx),
            cancel,
        }
    }

    /// 运行匹配循环
    pub async fn run(mut self) {
        info!("matcher service started");
        self.restore_search_queue().await;

        let mut match_rx = self.match_rx.take().expect("matcher inbox already taken");
        let cancel = self.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe_request = match_rx.recv() => match maybe_request {
                    Some(request) => {
                        if self.add_to_queue(request.clone()).await {
                            self.find_match(&request).await;
                        }
                    }
                    None => break,
                },
                // 收件箱空闲且队列里至少有两人时，对全队列补配一轮
                _ = tokio::time::sleep(IDLE_PASS_INTERVAL), if self.queue.len() >= 2 => {
                    let pending: Vec<SearchRequest> = self.queue.values().cloned().collect();
                    for request in pending {
                        if self.queue.contains_key(&request.user_id) {
                            self.find_match(&request).await;
                        }
                    }
                }
            }
        }
        info!("matcher service stopped");
    }

    /// 启动恢复：读取持久化的等待名单，逐个请求枢纽恢复会话
    pub(crate) async fn restore_search_queue(&mut self) {
        let waiting = match self.storage.list_waiting().await {
            Ok(waiting) => waiting,
            Err(err) => {
                warn!(error = %err, "failed to restore search queue");
                return;
            }
        };

        for user_id in waiting {
            if self.hub.restore_session(&user_id).await {
                self.queue
                    .insert(user_id.clone(), SearchRequest::new(&user_id));
            } else {
                // 会话无法恢复时放弃持久化的队列项
                if let Err(err) = self.storage.dequeue_search(&user_id).await {
                    warn!(%user_id, error = %err, "failed to drop stale queue entry");
                }
            }
        }
        info!(count = self.queue.len(), "restored users to search queue");
    }

    /// 入队：忽略已有活跃房间的请求，入队后镜像到持久化
    pub(crate) async fn add_to_queue(&mut self, request: SearchRequest) -> bool {
        match self.storage.active_room_id_for(&request.user_id).await {
            Ok(Some(room_id)) => {
                debug!(user_id = %request.user_id, %room_id, "ignoring search request, user already in a room");
                return false;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(user_id = %request.user_id, error = %err, "failed to check active room, dropping request");
                return false;
            }
        }

        let user_id = request.user_id.clone();
        self.queue.insert(user_id.clone(), request);
        if let Err(err) = self.storage.enqueue_search(&user_id).await {
            warn!(%user_id, error = %err, "failed to mirror queue entry to storage");
        }
        debug!(%user_id, "match request queued");
        true
    }

    /// 为给定请求寻找聊天对象
    ///
    /// 每轮只向存储发一次批量用户查询；候选遍历顺序不作保证。
    pub(crate) async fn find_match(&mut self, request: &SearchRequest) {
        let user_ids: Vec<String> = self.queue.keys().cloned().collect();
        let users = match self.storage.get_users_by_ids(&user_ids).await {
            Ok(users) => users,
            Err(err) => {
                warn!(error = %err, "failed to bulk fetch queued users");
                return;
            }
        };
        let user_map: HashMap<&str, &User> =
            users.iter().map(|user| (user.id.as_str(), user)).collect();

        let Some(user_a) = user_map.get(request.user_id.as_str()) else {
            return;
        };

        let mut candidate: Option<String> = None;
        for target_id in self.queue.keys() {
            if *target_id == request.user_id {
                continue;
            }
            let Some(user_b) = user_map.get(target_id.as_str()) else {
                continue;
            };
            // 任一方拉黑另一方即跳过；其余过滤条件是扩展点
            if user_a.has_blocked(&user_b.id) || user_b.has_blocked(&user_a.id) {
                continue;
            }
            candidate = Some(target_id.clone());
            break;
        }

        if let Some(target_id) = candidate {
            self.create_room_for_match(&request.user_id, &target_id)
                .await;
        }
    }

    /// 为一对用户建房并通知枢纽
    async fn create_room_for_match(&mut self, user1_id: &str, user2_id: &str) {
        let room_id = Uuid::new_v4().to_string();
        let room = ChatRoom::new(room_id.clone(), user1_id.to_string(), user2_id.to_string());

        if let Err(err) = self.storage.save_room(&room).await {
            warn!(%room_id, error = %err, "failed to save new room");
            return;
        }

        self.queue.remove(user1_id);
        self.queue.remove(user2_id);
        for user_id in [user1_id, user2_id] {
            if let Err(err) = self.storage.dequeue_search(user_id).await {
                warn!(%user_id, error = %err, "failed to remove queue entry from storage");
            }
        }

        if let Err(err) = self
            .hub
            .room_created(room_id.clone(), user1_id.to_string(), user2_id.to_string())
            .await
        {
            warn!(%room_id, error = %err, "failed to announce new room to hub");
            return;
        }
        info!(%room_id, user1 = %user1_id, user2 = %user2_id, "match found");
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub(crate) fn queue_contains(&self, user_id: &str) -> bool {
        self.queue.contains_key(user_id)
    }

    #[cfg(test)]
    pub(crate) fn insert_queue_entry(&mut self, request: SearchRequest) {
        self.queue.insert(request.user_id.clone(), request);
    }
}
