//! Wire 风格的依赖注入模块
//!
//! 按依赖顺序构建全部组件；外部依赖（PostgreSQL / Redis）带有限次
//! 重试，重试耗尽视为不可恢复的启动失败。

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use anochat_core::AppConfig;

use crate::config::HubConfig;
use crate::domain::repositories::{RoomBus, Storage};
use crate::domain::service::{ChatHub, ComplaintService, HubHandle, MatcherService};
use crate::infrastructure::messaging::RedisRoomBus;
use crate::infrastructure::persistence::{StorageService, run_migrations};

const MAX_CONNECT_RETRIES: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// 应用上下文 - 包含所有已初始化的组件
pub struct ApplicationContext {
    pub hub: ChatHub,
    pub matcher: MatcherService,
    pub handle: HubHandle,
    pub storage: Arc<dyn Storage>,
    pub bus: Arc<dyn RoomBus>,
    pub config: Arc<HubConfig>,
    pub cancel: CancellationToken,
}

/// 构建应用上下文
pub async fn initialize(
    app_config: &AppConfig,
    cancel: CancellationToken,
) -> Result<ApplicationContext> {
    // 1. 加载服务配置
    let config = Arc::new(HubConfig::from_app_config(app_config));

    // 2. 连接 PostgreSQL
    let pool = connect_postgres(&config).await?;

    // 3. 执行模式引导
    run_migrations(&pool).await?;

    // 4. 连接 Redis
    let redis_client = Arc::new(
        redis::Client::open(config.redis_url.as_str()).context("invalid redis url")?,
    );
    let redis_conn = connect_redis(&redis_client).await?;

    // 5. 构建存储服务
    let storage: Arc<dyn Storage> =
        Arc::new(StorageService::new(pool, redis_conn.clone()));

    // 6. 构建房间总线
    let bus: Arc<dyn RoomBus> = Arc::new(RedisRoomBus::new(redis_client, redis_conn));

    // 7. 构建枢纽
    let (mut hub, handle, match_rx) = ChatHub::new(
        Arc::clone(&storage),
        Arc::clone(&bus),
        Arc::clone(&config),
        cancel.clone(),
    );

    // 8. 构建投诉管道
    let complaints = Arc::new(ComplaintService::new(Arc::clone(&storage)));
    hub.set_complaint_pipeline(complaints);

    // 9. 构建匹配器
    let matcher = MatcherService::new(
        Arc::clone(&storage),
        handle.clone(),
        match_rx,
        cancel.clone(),
    );

    info!("application context initialized");
    Ok(ApplicationContext {
        hub,
        matcher,
        handle,
        storage,
        bus,
        config,
        cancel,
    })
}

/// 连接 PostgreSQL，有限次重试
async fn connect_postgres(config: &HubConfig) -> Result<PgPool> {
    for attempt in 1..=MAX_CONNECT_RETRIES {
        match PgPoolOptions::new()
            .max_connections(config.postgres_max_connections)
            .connect(&config.postgres_url)
            .await
        {
            Ok(pool) => {
                info!("PostgreSQL connection established");
                return Ok(pool);
            }
            Err(err) => {
                warn!(
                    attempt,
                    max = MAX_CONNECT_RETRIES,
                    error = %err,
                    "failed to connect PostgreSQL, retrying"
                );
                if attempt < MAX_CONNECT_RETRIES {
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
            }
        }
    }
    Err(anyhow!(
        "failed to connect PostgreSQL after {MAX_CONNECT_RETRIES} attempts"
    ))
}

/// 连接 Redis，有限次重试并做 PING 探活
async fn connect_redis(client: &redis::Client) -> Result<ConnectionManager> {
    for attempt in 1..=MAX_CONNECT_RETRIES {
        match ConnectionManager::new(client.clone()).await {
            Ok(mut conn) => {
                let pong: Result<String, redis::RedisError> =
                    redis::cmd("PING").query_async(&mut conn).await;
                match pong {
                    Ok(_) => {
                        info!("Redis connection established");
                        return Ok(conn);
                    }
                    Err(err) => {
                        warn!(attempt, error = %err, "redis ping failed, retrying");
                    }
                }
            }
            Err(err) => {
                warn!(
                    attempt,
                    max = MAX_CONNECT_RETRIES,
                    error = %err,
                    "failed to connect Redis, retrying"
                );
            }
        }
        if attempt < MAX_CONNECT_RETRIES {
            tokio::time::sleep(CONNECT_RETRY_DELAY).await;
        }
    }
    Err(anyhow!(
        "failed to connect Redis after {MAX_CONNECT_RETRIES} attempts"
    ))
}
