use std::env;
use std::time::Duration;

use anochat_core::AppConfig;

/// 枢纽服务配置
///
/// 由应用配置与环境变量分层得出，环境变量优先。
#[derive(Clone, Debug)]
pub struct HubConfig {
    pub bind_addr: String,
    pub bot_token: Option<String>,
    pub postgres_url: String,
    pub postgres_max_connections: u32,
    pub redis_url: String,

    /// 枢纽各收件箱的深度
    pub hub_inbox_depth: usize,
    /// 每个会话出站队列的深度
    pub session_outbound_depth: usize,

    /// 读侧 pong 超时
    pub pong_wait: Duration,
    /// 单次写超时
    pub write_wait: Duration,
    /// ping 周期（pong 超时的 9/10）
    pub ping_period: Duration,
    /// 单条消息最大字节数
    pub max_message_size: usize,

    pub dialog: DialogPolicy,
}

/// 对话质量启发式参数
#[derive(Clone, Copy, Debug)]
pub struct DialogPolicy {
    pub successful_duration: Duration,
    pub successful_messages: usize,
    pub successful_reward: i32,
    pub early_disconnect_duration: Duration,
    pub early_disconnect_messages: usize,
    pub early_disconnect_penalty: i32,
}

impl HubConfig {
    /// 从应用配置加载，环境变量覆盖文件值
    pub fn from_app_config(app: &AppConfig) -> Self {
        let bind_addr = env::var("ANOCHAT_BIND_ADDR")
            .ok()
            .unwrap_or_else(|| app.server.bind_addr.clone());

        let bot_token = env::var("BOT_TOKEN")
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| app.transport.bot_token.clone());

        let postgres_url = env::var("DATABASE_URL")
            .ok()
            .unwrap_or_else(|| app.postgres.url.clone());

        let postgres_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .or(app.postgres.max_connections)
            .unwrap_or(10);

        let redis_url = env::var("REDIS_URL")
            .ok()
            .unwrap_or_else(|| app.redis.url.clone());

        let pong_wait_secs = env_u64("TRANSPORT_PONG_WAIT_SECS", app.transport.pong_wait_secs);
        let write_wait_secs = env_u64("TRANSPORT_WRITE_WAIT_SECS", app.transport.write_wait_secs);

        let dialog = DialogPolicy {
            successful_duration: Duration::from_secs(env_u64(
                "SUCCESSFUL_DURATION",
                app.dialog.successful_duration_secs,
            )),
            successful_messages: env_usize("SUCCESSFUL_MESSAGES", app.dialog.successful_messages),
            successful_reward: env_i32("SUCCESSFUL_REWARD", app.dialog.successful_reward),
            early_disconnect_duration: Duration::from_secs(env_u64(
                "EARLY_DISCONNECT_DURATION",
                app.dialog.early_disconnect_duration_secs,
            )),
            early_disconnect_messages: env_usize(
                "EARLY_DISCONNECT_MESSAGES",
                app.dialog.early_disconnect_messages,
            ),
            early_disconnect_penalty: env_i32(
                "EARLY_DISCONNECT_PENALTY",
                app.dialog.early_disconnect_penalty,
            ),
        };

        Self {
            bind_addr,
            bot_token,
            postgres_url,
            postgres_max_connections,
            redis_url,
            hub_inbox_depth: app.channels.hub_inbox_depth,
            session_outbound_depth: app.channels.session_outbound_depth,
            pong_wait: Duration::from_secs(pong_wait_secs),
            write_wait: Duration::from_secs(write_wait_secs),
            ping_period: Duration::from_secs((pong_wait_secs * 9) / 10),
            max_message_size: app.transport.max_message_size,
            dialog,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

fn env_u64(name: &str, fallback: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(fallback)
}

fn env_usize(name: &str, fallback: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(fallback)
}

fn env_i32(name: &str, fallback: i32) -> i32 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(fallback)
}
