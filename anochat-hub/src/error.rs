//! 统一异常处理模块

use thiserror::Error;

/// 枢纽服务错误类型
#[derive(Debug, Error)]
pub enum HubError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 存储不可用
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// 总线不可用
    #[error("Bus unavailable: {0}")]
    BusUnavailable(String),

    /// 会话出站队列已关闭
    #[error("Session outbound closed for user {0}")]
    SessionClosed(String),

    /// 会话出站队列已满
    #[error("Session outbound full for user {0}")]
    OutboundFull(String),
}

impl From<anyhow::Error> for HubError {
    fn from(err: anyhow::Error) -> Self {
        HubError::StorageUnavailable(err.to_string())
    }
}
