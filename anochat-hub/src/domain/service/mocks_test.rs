//! 测试替身与共用工具

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;

use crate::domain::model::ChatMessage;
use crate::domain::session::ChatSession;

/// 测试会话：出站队列可直接取走内容做断言
pub(crate) struct MockSession {
    user_id: String,
    room_id: RwLock<String>,
    outbound_tx: Mutex<Option<mpsc::Sender<ChatMessage>>>,
    outbound_rx: Mutex<mpsc::Receiver<ChatMessage>>,
    close_calls: AtomicUsize,
}

impl MockSession {
    pub(crate) fn new(user_id: &str) -> Arc<Self> {
        Self::with_capacity(user_id, 10)
    }

    pub(crate) fn with_capacity(user_id: &str, capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity);
        Arc::new(Self {
            user_id: user_id.to_string(),
            room_id: RwLock::new(String::new()),
            outbound_tx: Mutex::new(Some(tx)),
            outbound_rx: Mutex::new(rx),
            close_calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn with_room(user_id: &str, room_id: &str) -> Arc<Self> {
        let session = Self::new(user_id);
        session.set_room_id(room_id);
        session
    }

    /// 取走目前积压的全部出站消息
    pub(crate) fn drain(&self) -> Vec<ChatMessage> {
        let mut rx = self.outbound_rx.lock().expect("outbox lock poisoned");
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    pub(crate) fn close_count(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

impl ChatSession for MockSession {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn room_id(&self) -> String {
        self.room_id.read().expect("room lock poisoned").clone()
    }

    fn set_room_id(&self, room_id: &str) {
        *self.room_id.write().expect("room lock poisoned") = room_id.to_string();
    }

    fn outbound(&self) -> Option<mpsc::Sender<ChatMessage>> {
        self.outbound_tx.lock().expect("tx lock poisoned").clone()
    }

    fn start(self: Arc<Self>) {}

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.outbound_tx.lock().expect("tx lock poisoned").take();
    }
}
