//! 匹配器测试
//!
//! 直接驱动匹配器的入队与配对路径，枢纽真实运行以接收建房事件。

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::sleep;
    use tokio_util::sync::CancellationToken;

    use crate::config::HubConfig;
    use crate::domain::model::{ChatRoom, SearchRequest, User};
    use crate::domain::repositories::{RoomBus, Storage};
    use crate::domain::service::hub::ChatHub;
    use crate::domain::service::matcher::MatcherService;
    use crate::domain::service::mocks_test::MockSession;
    use crate::domain::session::ChatSession;
    use crate::infrastructure::persistence::{InMemoryBus, InMemoryStorage};

    type RestoreFuture = std::pin::Pin<
        Box<dyn std::future::Future<Output = anyhow::Result<Arc<dyn ChatSession>>> + Send>,
    >;

    struct Fixture {
        storage: Arc<InMemoryStorage>,
        matcher: MatcherService,
        hub: crate::domain::service::hub::HubHandle,
        cancel: CancellationToken,
    }

    /// 枢纽跑在后台任务里，匹配器留在测试里直接调用
    async fn fixture() -> Fixture {
        let storage = Arc::new(InMemoryStorage::new());
        let bus = Arc::new(InMemoryBus::new());
        let config = Arc::new(HubConfig::default());
        let cancel = CancellationToken::new();
        let (hub, handle, match_rx) = ChatHub::new(
            storage.clone() as Arc<dyn Storage>,
            bus as Arc<dyn RoomBus>,
            config,
            cancel.clone(),
        );
        let matcher = MatcherService::new(
            storage.clone() as Arc<dyn Storage>,
            handle.clone(),
            match_rx,
            cancel.clone(),
        );
        tokio::spawn(hub.run());
        sleep(Duration::from_millis(20)).await;
        Fixture {
            storage,
            matcher,
            hub: handle,
            cancel,
        }
    }

    /// 入队会同时写入内存队列与持久化镜像
    #[tokio::test(start_paused = true)]
    async fn add_to_queue_mirrors_to_storage() {
        let mut fixture = fixture().await;
        fixture
            .storage
            .seed_user(User::new("user_123".into(), None))
            .await;

        let queued = fixture
            .matcher
            .add_to_queue(SearchRequest::new("user_123"))
            .await;

        assert!(queued);
        assert!(fixture.matcher.queue_contains("user_123"));
        assert_eq!(
            fixture.storage.list_waiting().await.unwrap(),
            vec!["user_123"]
        );
        fixture.cancel.cancel();
    }

    /// 已有活跃房间的请求被忽略
    #[tokio::test(start_paused = true)]
    async fn request_from_roomed_user_is_ignored() {
        let mut fixture = fixture().await;
        fixture
            .storage
            .seed_user(User::new("user_a".into(), None))
            .await;
        fixture
            .storage
            .seed_room(ChatRoom::new("room-1".into(), "user_a".into(), "x".into()))
            .await;

        let queued = fixture
            .matcher
            .add_to_queue(SearchRequest::new("user_a"))
            .await;

        assert!(!queued);
        assert!(!fixture.matcher.queue_contains("user_a"));
        assert!(fixture.storage.list_waiting().await.unwrap().is_empty());
        fixture.cancel.cancel();
    }

    /// 性质 3：任何状态下都不会自配对
    #[tokio::test(start_paused = true)]
    async fn no_self_match() {
        let mut fixture = fixture().await;
        fixture
            .storage
            .seed_user(User::new("user_solo".into(), None))
            .await;
        let session = MockSession::new("user_solo");
        fixture
            .hub
            .register(session.clone() as Arc<dyn ChatSession>)
            .await
            .unwrap();
        sleep(Duration::from_millis(20)).await;

        fixture
            .matcher
            .insert_queue_entry(SearchRequest::new("user_solo"));
        fixture
            .matcher
            .find_match(&SearchRequest::new("user_solo"))
            .await;
        sleep(Duration::from_millis(50)).await;

        assert!(fixture.matcher.queue_contains("user_solo"));
        assert_eq!(session.room_id(), "");
        assert!(
            fixture
                .storage
                .active_room_id_for("user_solo")
                .await
                .unwrap()
                .is_none()
        );
        fixture.cancel.cancel();
    }

    /// 成功配对：建房、双方会话拿到房间、队列清空
    #[tokio::test(start_paused = true)]
    async fn successful_match_creates_room_and_clears_queue() {
        let mut fixture = fixture().await;
        fixture
            .storage
            .seed_user(User::new("user_x".into(), None))
            .await;
        fixture
            .storage
            .seed_user(User::new("user_y".into(), None))
            .await;
        let session_x = MockSession::new("user_x");
        let session_y = MockSession::new("user_y");
        for session in [session_x.clone(), session_y.clone()] {
            fixture
                .hub
                .register(session as Arc<dyn ChatSession>)
                .await
                .unwrap();
        }
        sleep(Duration::from_millis(20)).await;

        fixture
            .matcher
            .insert_queue_entry(SearchRequest::new("user_x"));
        fixture
            .matcher
            .insert_queue_entry(SearchRequest::new("user_y"));
        fixture.storage.enqueue_search("user_x").await.unwrap();
        fixture.storage.enqueue_search("user_y").await.unwrap();

        fixture
            .matcher
            .find_match(&SearchRequest::new("user_x"))
            .await;
        sleep(Duration::from_millis(100)).await;

        assert_eq!(fixture.matcher.queue_len(), 0);
        assert!(fixture.storage.list_waiting().await.unwrap().is_empty());

        let room_x = fixture
            .storage
            .active_room_id_for("user_x")
            .await
            .unwrap()
            .expect("room for user_x");
        assert_eq!(session_x.room_id(), room_x);
        assert_eq!(session_y.room_id(), room_x);
        fixture.cancel.cancel();
    }

    /// 性质 4：单向拉黑即可阻止配对
    #[tokio::test(start_paused = true)]
    async fn one_way_block_excludes_pairing() {
        let mut fixture = fixture().await;
        let mut user_a = User::new("user_a".into(), None);
        user_a.blocked_users.push("user_b".into());
        fixture.storage.seed_user(user_a).await;
        fixture
            .storage
            .seed_user(User::new("user_b".into(), None))
            .await;

        fixture
            .matcher
            .insert_queue_entry(SearchRequest::new("user_a"));
        fixture
            .matcher
            .insert_queue_entry(SearchRequest::new("user_b"));

        // 两个方向都尝试一遍
        fixture
            .matcher
            .find_match(&SearchRequest::new("user_a"))
            .await;
        fixture
            .matcher
            .find_match(&SearchRequest::new("user_b"))
            .await;
        sleep(Duration::from_millis(50)).await;

        assert_eq!(fixture.matcher.queue_len(), 2);
        assert!(
            fixture
                .storage
                .active_room_id_for("user_a")
                .await
                .unwrap()
                .is_none()
        );
        fixture.cancel.cancel();
    }

    /// 性质 5：配对序列之后每人至多一个活跃房间
    #[tokio::test(start_paused = true)]
    async fn at_most_one_active_room_per_user() {
        let mut fixture = fixture().await;
        for id in ["user_a", "user_b", "user_c"] {
            fixture.storage.seed_user(User::new(id.into(), None)).await;
        }

        fixture
            .matcher
            .insert_queue_entry(SearchRequest::new("user_a"));
        fixture
            .matcher
            .insert_queue_entry(SearchRequest::new("user_b"));
        fixture
            .matcher
            .find_match(&SearchRequest::new("user_a"))
            .await;
        sleep(Duration::from_millis(50)).await;

        // A 已经在房间里，重新入队会被忽略；即便直接塞进队列，
        // 存储层的建房校验也会拒绝第二个活跃房间
        assert!(
            !fixture
                .matcher
                .add_to_queue(SearchRequest::new("user_a"))
                .await
        );
        fixture
            .matcher
            .insert_queue_entry(SearchRequest::new("user_a"));
        fixture
            .matcher
            .insert_queue_entry(SearchRequest::new("user_c"));
        fixture
            .matcher
            .find_match(&SearchRequest::new("user_c"))
            .await;
        sleep(Duration::from_millis(50)).await;

        let rooms = fixture.storage.active_room_ids().await.unwrap();
        assert_eq!(rooms.len(), 1, "second pairing for user_a must be refused");
        fixture.cancel.cancel();
    }

    /// 启动恢复：无法恢复的会话对应的持久化队列项被丢弃
    #[tokio::test(start_paused = true)]
    async fn restore_drops_entries_without_session() {
        let storage = Arc::new(InMemoryStorage::new());
        let bus = Arc::new(InMemoryBus::new());
        let config = Arc::new(HubConfig::default());
        let cancel = CancellationToken::new();
        let (mut hub, handle, match_rx) = ChatHub::new(
            storage.clone() as Arc<dyn Storage>,
            bus as Arc<dyn RoomBus>,
            config,
            cancel.clone(),
        );
        // 恢复回调：只认识 user_ok
        hub.set_restorer(Arc::new(|user_id: String| -> RestoreFuture {
            Box::pin(async move {
                if user_id == "user_ok" {
                    Ok(MockSession::new(&user_id) as Arc<dyn ChatSession>)
                } else {
                    anyhow::bail!("unknown user")
                }
            })
        }));
        tokio::spawn(hub.run());

        storage.enqueue_search("user_ok").await.unwrap();
        storage.enqueue_search("user_gone").await.unwrap();

        let mut matcher = MatcherService::new(
            storage.clone() as Arc<dyn Storage>,
            handle,
            match_rx,
            cancel.clone(),
        );
        matcher.restore_search_queue().await;
        sleep(Duration::from_millis(50)).await;

        assert!(matcher.queue_contains("user_ok"));
        assert!(!matcher.queue_contains("user_gone"));
        assert_eq!(storage.list_waiting().await.unwrap(), vec!["user_ok"]);
        cancel.cancel();
    }
}
