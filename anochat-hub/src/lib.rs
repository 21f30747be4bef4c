//! anochat 实时路由与匹配核心
//!
//! 匿名 1 对 1 聊天后端的核心：会话枢纽、匹配器、按房间分频道的
//! 扇出总线，以及它们对持久化端口的约定。传输层（bot / socket 的
//! 字节编解码）通过会话契约接入，不在本 crate 内。

pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interface;
pub mod service;

pub use config::{DialogPolicy, HubConfig};
pub use domain::model::{
    ChatMessage, ChatRoom, Complaint, ComplaintSeverity, MessageKind, MessageRecord,
    SearchRequest, SystemKey, User,
};
pub use domain::repositories::{BusFrame, BusSubscription, RoomBus, Storage};
pub use domain::service::{
    ChatHub, ComplaintPipeline, ComplaintService, HubHandle, MatcherService, SessionRestorer,
};
pub use domain::session::ChatSession;
pub use error::HubError;
