//! 内嵌的模式引导
//!
//! 启动时逐条执行，语句全部幂等。

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;

const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS users (
        id TEXT PRIMARY KEY,
        external_id BIGINT UNIQUE,
        language TEXT NOT NULL DEFAULT 'en',
        blocked_users TEXT[] NOT NULL DEFAULT '{}',
        is_blocked BOOLEAN NOT NULL DEFAULT FALSE,
        block_end_time BIGINT NOT NULL DEFAULT 0,
        block_level INT NOT NULL DEFAULT 0,
        last_ban_date BIGINT NOT NULL DEFAULT 0,
        reputation INT NOT NULL DEFAULT 1000,
        media_spoiler BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE TABLE IF NOT EXISTS rooms (
        room_id TEXT PRIMARY KEY,
        user1_id TEXT NOT NULL,
        user2_id TEXT NOT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        started_at TIMESTAMPTZ NOT NULL,
        ended_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS idx_rooms_active_user1 ON rooms (user1_id) WHERE is_active",
    "CREATE INDEX IF NOT EXISTS idx_rooms_active_user2 ON rooms (user2_id) WHERE is_active",
    "CREATE TABLE IF NOT EXISTS messages (
        id BIGSERIAL PRIMARY KEY,
        room_id TEXT NOT NULL,
        sender_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        body TEXT NOT NULL,
        caption TEXT NOT NULL DEFAULT '',
        reply_to_id BIGINT,
        transport_id_sender BIGINT,
        transport_id_receiver BIGINT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_room ON messages (room_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_messages_tid_sender ON messages (transport_id_sender)",
    "CREATE INDEX IF NOT EXISTS idx_messages_tid_receiver ON messages (transport_id_receiver)",
    "CREATE TABLE IF NOT EXISTS complaints (
        id BIGSERIAL PRIMARY KEY,
        room_id TEXT NOT NULL,
        reporter_id TEXT NOT NULL,
        suspect_id TEXT NOT NULL,
        logged_messages TEXT NOT NULL DEFAULT '',
        reason TEXT NOT NULL DEFAULT '',
        severity TEXT NOT NULL DEFAULT 'low',
        status TEXT NOT NULL DEFAULT 'new',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_complaints_suspect ON complaints (suspect_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_complaints_room ON complaints (room_id)",
];

/// 执行全部模式引导语句
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for statement in MIGRATIONS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("failed to run schema migration")?;
    }
    info!(count = MIGRATIONS.len(), "schema migrations complete");
    Ok(())
}
