//! 会话契约
//!
//! 会话是传输层与枢纽之间的约定：每个连接一个对象，持有一条有界
//! 出站队列。会话从不直接访问枢纽的会话表，只通过枢纽暴露的收件箱
//! 与之通信。

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::model::ChatMessage;
use crate::error::HubError;

/// 会话契约
///
/// 两个具体实现：socket 客户端与 bot 客户端（见 `interface::session`）。
pub trait ChatSession: Send + Sync {
    /// 路由键
    fn user_id(&self) -> &str;

    /// 当前房间 ID，空字符串表示空闲
    fn room_id(&self) -> String;

    /// 分配 / 清除房间；由枢纽在匹配成功和房间关闭时调用
    fn set_room_id(&self, room_id: &str);

    /// 出站队列的发送端；队列已关闭时返回 None
    fn outbound(&self) -> Option<mpsc::Sender<ChatMessage>>;

    /// 启动出站投递循环
    fn start(self: Arc<Self>);

    /// 关闭出站队列，投递循环清空后退出；幂等
    fn close(&self);
}

/// 非阻塞入队
///
/// 枢纽事件循环用它向会话投递；队列满时丢弃并返回错误，绝不阻塞。
pub fn try_enqueue(session: &dyn ChatSession, message: ChatMessage) -> Result<(), HubError> {
    let Some(tx) = session.outbound() else {
        return Err(HubError::SessionClosed(session.user_id().to_string()));
    };
    match tx.try_send(message) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(_)) => Err(HubError::OutboundFull(session.user_id().to_string())),
        Err(TrySendError::Closed(_)) => {
            Err(HubError::SessionClosed(session.user_id().to_string()))
        }
    }
}
