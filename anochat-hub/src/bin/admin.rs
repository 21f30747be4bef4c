//! 管理命令行
//!
//! 用法：
//!   admin ban <user_id> [hours]
//!   admin unban <user_id>
//!   admin confirm-complaint <complaint_id>
//!
//! 退出码：0 成功，2 用法错误，1 其他失败。

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use redis::aio::ConnectionManager;
use sqlx::postgres::PgPoolOptions;

use anochat_hub::config::HubConfig;
use anochat_hub::domain::repositories::Storage;
use anochat_hub::domain::service::ComplaintService;
use anochat_hub::infrastructure::persistence::StorageService;

fn usage() -> ExitCode {
    eprintln!("Usage: admin <command> [args]");
    eprintln!("  ban <user_id> [hours]");
    eprintln!("  unban <user_id>");
    eprintln!("  confirm-complaint <complaint_id>");
    ExitCode::from(2)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        return usage();
    }

    let command = match parse_command(&args) {
        Some(command) => command,
        None => return usage(),
    };

    match execute(command).await {
        Ok(report) => {
            println!("{report}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

enum AdminCommand {
    Ban { user_id: String, hours: u32 },
    Unban { user_id: String },
    ConfirmComplaint { complaint_id: i64 },
}

fn parse_command(args: &[String]) -> Option<AdminCommand> {
    match args[1].as_str() {
        "ban" => {
            if args.len() < 3 || args.len() > 4 {
                return None;
            }
            let hours = match args.get(3) {
                Some(raw) => raw.parse::<u32>().ok()?,
                None => 0,
            };
            Some(AdminCommand::Ban {
                user_id: args[2].clone(),
                hours,
            })
        }
        "unban" => {
            if args.len() != 3 {
                return None;
            }
            Some(AdminCommand::Unban {
                user_id: args[2].clone(),
            })
        }
        "confirm-complaint" => {
            if args.len() != 3 {
                return None;
            }
            let complaint_id = args[2].parse::<i64>().ok()?;
            Some(AdminCommand::ConfirmComplaint { complaint_id })
        }
        _ => None,
    }
}

async fn execute(command: AdminCommand) -> Result<String> {
    let app_config = anochat_core::load_config(None);
    let config = HubConfig::from_app_config(app_config);

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.postgres_url)
        .await
        .context("failed to connect database")?;
    let redis_client =
        redis::Client::open(config.redis_url.as_str()).context("invalid redis url")?;
    let redis_conn = ConnectionManager::new(redis_client)
        .await
        .context("failed to connect redis")?;
    let storage: Arc<dyn Storage> = Arc::new(StorageService::new(pool, redis_conn));

    match command {
        AdminCommand::Ban { user_id, hours } => {
            let Some(mut user) = storage.get_user_by_id(&user_id).await? else {
                bail!("user {user_id} not found");
            };
            user.is_blocked = true;
            user.block_end_time = if hours > 0 {
                chrono::Utc::now().timestamp() + i64::from(hours) * 3600
            } else {
                0
            };
            storage.update_user(&user).await?;
            storage.ban(&user_id, u64::from(hours) * 3600).await?;
            Ok(format!("User {user_id} has been banned."))
        }
        AdminCommand::Unban { user_id } => {
            let Some(mut user) = storage.get_user_by_id(&user_id).await? else {
                bail!("user {user_id} not found");
            };
            user.is_blocked = false;
            user.block_end_time = 0;
            storage.update_user(&user).await?;
            storage.unban(&user_id).await?;
            Ok(format!("User {user_id} has been unbanned."))
        }
        AdminCommand::ConfirmComplaint { complaint_id } => {
            let complaints = ComplaintService::new(storage);
            if !complaints.confirm_complaint(complaint_id).await? {
                bail!("complaint {complaint_id} not found");
            }
            Ok(format!("Complaint {complaint_id} has been confirmed."))
        }
    }
}
