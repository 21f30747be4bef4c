//! 内存存储与内存总线的合同测试

#[cfg(test)]
mod tests {
    use crate::domain::model::{ChatMessage, ChatRoom, MessageKind, User};
    use crate::domain::repositories::{RoomBus, Storage};
    use crate::infrastructure::persistence::{InMemoryBus, InMemoryStorage};

    async fn saved_text(storage: &InMemoryStorage, sender: &str, room: &str, body: &str) -> i64 {
        storage
            .save_message(&ChatMessage::content(sender, room, MessageKind::Text, body))
            .await
            .unwrap()
    }

    /// 消息 ID 单调递增且从 1 开始
    #[tokio::test]
    async fn message_ids_are_monotonic() {
        let storage = InMemoryStorage::new();
        let first = saved_text(&storage, "a", "r", "one").await;
        let second = saved_text(&storage, "a", "r", "two").await;
        assert_eq!(first, 1);
        assert!(second > first);
    }

    /// 性质 8：回复解析往返
    ///
    /// 双方各自回报传输 ID 后，对每个接收方的解析结果都等于
    /// 该接收方聊天里那份副本的 ID。
    #[tokio::test]
    async fn reply_resolution_round_trip() {
        let storage = InMemoryStorage::new();
        let id = saved_text(&storage, "user_a", "room-1", "original").await;

        storage.save_transport_id(id, "user_a", 111).await.unwrap();
        storage.save_transport_id(id, "user_b", 222).await.unwrap();

        // 发送方回报的 ID 落在发送槽，接收方的落在接收槽
        let record = storage.find_message_by_id(id).await.unwrap().unwrap();
        assert_eq!(record.transport_id_sender, Some(111));
        assert_eq!(record.transport_id_receiver, Some(222));

        assert_eq!(
            storage
                .lookup_partner_transport_id_for_reply(id, "user_a")
                .await
                .unwrap(),
            Some(111)
        );
        assert_eq!(
            storage
                .lookup_partner_transport_id_for_reply(id, "user_b")
                .await
                .unwrap(),
            Some(222)
        );

        // 任一侧的传输 ID 都能反查回内部 ID
        assert_eq!(
            storage
                .lookup_history_id_by_transport_id(111)
                .await
                .unwrap(),
            Some(id)
        );
        assert_eq!(
            storage
                .lookup_history_id_by_transport_id(222)
                .await
                .unwrap(),
            Some(id)
        );
        assert_eq!(
            storage.lookup_history_id_by_transport_id(999).await.unwrap(),
            None
        );
    }

    /// 媒体编辑反查：相同内容取最早一条
    #[tokio::test]
    async fn media_lookup_merges_duplicate_content() {
        let storage = InMemoryStorage::new();
        let first = storage
            .save_message(&ChatMessage::content(
                "user_a",
                "room-1",
                MessageKind::Photo,
                "file-1",
            ))
            .await
            .unwrap();
        let second = storage
            .save_message(&ChatMessage::content(
                "user_a",
                "room-1",
                MessageKind::Photo,
                "file-1",
            ))
            .await
            .unwrap();
        storage.save_transport_id(first, "user_a", 50).await.unwrap();
        storage
            .save_transport_id(second, "user_a", 50)
            .await
            .unwrap();

        assert_eq!(
            storage
                .lookup_history_id_by_transport_id_media(50)
                .await
                .unwrap(),
            Some(first),
            "earliest record per content wins"
        );
    }

    /// 性质 5：存储层拒绝第二个活跃房间
    #[tokio::test]
    async fn save_room_enforces_single_active_room() {
        let storage = InMemoryStorage::new();
        storage
            .save_room(&ChatRoom::new("r1".into(), "a".into(), "b".into()))
            .await
            .unwrap();

        let err = storage
            .save_room(&ChatRoom::new("r2".into(), "b".into(), "c".into()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("active room"));

        // 关闭旧房间后可以再配
        storage.close_room("r1").await.unwrap();
        storage
            .save_room(&ChatRoom::new("r2".into(), "b".into(), "c".into()))
            .await
            .unwrap();
        assert_eq!(storage.active_room_ids().await.unwrap(), vec!["r2"]);
        assert_eq!(
            storage.active_room_id_for("a").await.unwrap(),
            None,
            "closed room no longer counts"
        );
    }

    /// 声誉分截断在 0..=1000
    #[tokio::test]
    async fn reputation_is_clamped() {
        let storage = InMemoryStorage::new();
        storage.seed_user(User::new("u".into(), None)).await;

        storage.update_reputation("u", 500).await.unwrap();
        assert_eq!(
            storage.get_user_by_id("u").await.unwrap().unwrap().reputation,
            1000
        );
        storage.update_reputation("u", -5000).await.unwrap();
        assert_eq!(
            storage.get_user_by_id("u").await.unwrap().unwrap().reputation,
            0
        );
    }

    /// 拉黑 / 解除拉黑
    #[tokio::test]
    async fn block_and_unblock() {
        let storage = InMemoryStorage::new();
        storage.seed_user(User::new("a".into(), None)).await;

        storage.block("a", "b").await.unwrap();
        storage.block("a", "b").await.unwrap();
        let user = storage.get_user_by_id("a").await.unwrap().unwrap();
        assert_eq!(user.blocked_users, vec!["b"], "blocking is idempotent");

        storage.unblock("a", "b").await.unwrap();
        let user = storage.get_user_by_id("a").await.unwrap().unwrap();
        assert!(user.blocked_users.is_empty());
    }

    /// 首次接触惰性建档，重复接触返回同一用户
    #[tokio::test]
    async fn save_user_if_absent_is_idempotent() {
        let storage = InMemoryStorage::new();
        let first = storage.save_user_if_absent(42).await.unwrap();
        let second = storage.save_user_if_absent(42).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.reputation, 1000);
        assert_eq!(
            storage.get_user_by_external(42).await.unwrap().unwrap().id,
            first.id
        );
    }

    /// 封禁标记的过期语义
    #[tokio::test]
    async fn ban_flag_expires() {
        let storage = InMemoryStorage::new();
        storage.ban("u", 3600).await.unwrap();
        assert!(storage.is_banned("u").await.unwrap());

        storage.unban("u").await.unwrap();
        assert!(!storage.is_banned("u").await.unwrap());

        // 无限期封禁
        storage.ban("u", 0).await.unwrap();
        assert!(storage.is_banned("u").await.unwrap());
    }

    /// 等待队列集合语义
    #[tokio::test]
    async fn search_queue_is_a_set() {
        let storage = InMemoryStorage::new();
        storage.enqueue_search("a").await.unwrap();
        storage.enqueue_search("a").await.unwrap();
        storage.enqueue_search("b").await.unwrap();

        let mut waiting = storage.list_waiting().await.unwrap();
        waiting.sort();
        assert_eq!(waiting, vec!["a", "b"]);

        storage.dequeue_search("a").await.unwrap();
        assert_eq!(storage.list_waiting().await.unwrap(), vec!["b"]);
    }

    /// 用户状态与属性存取
    #[tokio::test]
    async fn user_state_and_attributes() {
        let storage = InMemoryStorage::new();
        storage
            .set_user_state("u", "awaiting_report_reason")
            .await
            .unwrap();
        assert_eq!(
            storage.get_user_state("u").await.unwrap().as_deref(),
            Some("awaiting_report_reason")
        );
        storage.clear_user_state("u").await.unwrap();
        assert_eq!(storage.get_user_state("u").await.unwrap(), None);

        storage.set_attribute("u", "lang_hint", "uk").await.unwrap();
        assert_eq!(
            storage.get_attribute("u", "lang_hint").await.unwrap().as_deref(),
            Some("uk")
        );
        storage.delete_attribute("u", "lang_hint").await.unwrap();
        assert_eq!(storage.get_attribute("u", "lang_hint").await.unwrap(), None);
    }

    /// 总线：同频道保序，多订阅者各得一份，close 幂等
    #[tokio::test]
    async fn bus_preserves_order_and_fans_out() {
        let bus = InMemoryBus::new();
        let mut sub1 = bus.subscribe_all().await.unwrap();
        let mut sub2 = bus.subscribe_all().await.unwrap();

        for n in 0..3 {
            bus.publish("room-1", format!("p{n}").as_bytes())
                .await
                .unwrap();
        }

        for sub in [&mut sub1, &mut sub2] {
            for n in 0..3 {
                let frame = sub.recv().await.unwrap();
                assert_eq!(frame.channel, "room-1");
                assert_eq!(frame.payload, format!("p{n}").into_bytes());
            }
        }

        sub1.close();
        sub1.close();
        assert!(sub1.recv().await.is_none(), "closed subscription yields None");

        // 其余订阅者不受影响
        bus.publish("room-2", b"after").await.unwrap();
        let frame = sub2.recv().await.unwrap();
        assert_eq!(frame.channel, "room-2");
    }
}
