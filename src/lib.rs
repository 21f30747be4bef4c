//! anochat 公共库
//!
//! 提供统一的配置加载和日志初始化功能

pub mod config;
pub mod tracing;

pub use config::{
    AppConfig, ChannelConfig, DialogPolicyConfig, LoggingConfig, PostgresConfig, RedisConfig,
    ServerConfig, TransportConfig, app_config, load_config,
};
pub use tracing::init_tracing_from_config;
