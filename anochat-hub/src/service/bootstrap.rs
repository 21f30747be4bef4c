//! 应用启动器 - 负责配置加载、信号处理与服务启动

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::wire;

pub use wire::ApplicationContext;

/// 应用启动器
pub struct ApplicationBootstrap;

impl ApplicationBootstrap {
    /// 运行应用的主入口点
    pub async fn run() -> Result<()> {
        let app_config = anochat_core::load_config(None);
        anochat_core::init_tracing_from_config(Some(&app_config.logging));

        let cancel = install_signal_handler();
        let context = wire::initialize(app_config, cancel).await?;

        Self::run_with_context(context).await
    }

    /// 运行服务（带应用上下文）
    pub async fn run_with_context(context: ApplicationContext) -> Result<()> {
        info!(
            bind_addr = %context.config.bind_addr,
            "starting anochat hub (transports attach via hub handle)"
        );

        let matcher_task = tokio::spawn(context.matcher.run());
        let hub_task = tokio::spawn(context.hub.run());

        // 等待取消信号；枢纽与匹配器各自监听同一令牌并自行收尾
        context.cancel.cancelled().await;

        matcher_task.await.context("matcher task panicked")?;
        hub_task.await.context("hub task panicked")??;

        info!("anochat hub stopped");
        Ok(())
    }
}

/// 安装 SIGTERM / SIGINT 处理器
///
/// 任一信号触发时取消返回的令牌。
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

            tokio::select! {
                _ = ctrl_c => {
                    info!("received SIGINT, initiating shutdown");
                }
                _ = sigterm.recv() => {
                    info!("received SIGTERM, initiating shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received Ctrl+C, initiating shutdown");
        }

        token_clone.cancel();
    });

    token
}
