use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            username      TEXT PRIMARY KEY,
            tagline       TEXT NOT NULL DEFAULT '',
            avatar_hash   TEXT NOT NULL DEFAULT '',
            is_admin      INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL,
            last_seen_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS feeds (
            name          TEXT PRIMARY KEY,
            owner         TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE,
            description   TEXT NOT NULL DEFAULT '',
            created_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS follows (
            username      TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE,
            alias         TEXT NOT NULL,
            url           TEXT NOT NULL,
            PRIMARY KEY (username, url)
        );

        CREATE INDEX IF NOT EXISTS idx_follows_url
            ON follows(url);

        CREATE TABLE IF NOT EXISTS mutes (
            username      TEXT NOT NULL REFERENCES users(username) ON DELETE CASCADE,
            key           TEXT NOT NULL,
            PRIMARY KEY (username, key)
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id            TEXT PRIMARY KEY,
            username      TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            expires_at    TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_expiry
            ON sessions(expires_at);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
