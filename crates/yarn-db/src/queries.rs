use std::collections::BTreeMap;

use crate::Database;
use crate::models::{FeedRow, FollowRow, SessionRow, UserRow};
use anyhow::{Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Row};

impl Database {
    // -- Users --

    /// Insert a user if missing. Returns whether a row was created.
    pub fn create_user(&self, username: &str, is_admin: bool, now: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO users (username, is_admin, created_at, last_seen_at) VALUES (?1, ?2, ?3, ?3)",
                rusqlite::params![username, is_admin, ts(now)],
            )?;
            Ok(n > 0)
        })
    }

    pub fn get_user(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, username))
    }

    pub fn has_user(&self, username: &str) -> Result<bool> {
        Ok(self.get_user(username)?.is_some())
    }

    pub fn get_all_users(&self) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT username, tagline, avatar_hash, is_admin, created_at, last_seen_at FROM users ORDER BY username",
            )?;
            let rows = stmt.query_map([], user_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn count_users(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    pub fn update_profile(&self, username: &str, tagline: &str, avatar_hash: &str) -> Result<()> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE users SET tagline = ?2, avatar_hash = ?3 WHERE username = ?1",
                (username, tagline, avatar_hash),
            )?;
            if n == 0 {
                return Err(anyhow!("User not found: {}", username));
            }
            Ok(())
        })
    }

    pub fn touch_user(&self, username: &str, now: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE users SET last_seen_at = ?2 WHERE username = ?1",
                (username, ts(now)),
            )?;
            Ok(())
        })
    }

    /// Users seen at or after `since`.
    pub fn count_active_users(&self, since: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE last_seen_at >= ?1",
                [ts(since)],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    pub fn delete_user(&self, username: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM users WHERE username = ?1", [username])?;
            Ok(())
        })
    }

    // -- Feeds --

    pub fn create_feed(&self, name: &str, owner: &str, description: &str, now: DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO feeds (name, owner, description, created_at) VALUES (?1, ?2, ?3, ?4)",
                (name, owner, description, ts(now)),
            )?;
            Ok(n > 0)
        })
    }

    pub fn get_feed(&self, name: &str) -> Result<Option<FeedRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT name, owner, description, created_at FROM feeds WHERE name = ?1",
                [name],
                feed_row,
            )
            .optional()
        })
    }

    pub fn has_feed(&self, name: &str) -> Result<bool> {
        Ok(self.get_feed(name)?.is_some())
    }

    pub fn get_all_feeds(&self) -> Result<Vec<FeedRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name, owner, description, created_at FROM feeds ORDER BY name")?;
            let rows = stmt.query_map([], feed_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn get_feeds_owned_by(&self, owner: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM feeds WHERE owner = ?1 ORDER BY name")?;
            let rows = stmt
                .query_map([owner], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })
    }

    // -- Follows --

    pub fn follow(&self, username: &str, alias: &str, url: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO follows (username, alias, url) VALUES (?1, ?2, ?3)
                 ON CONFLICT(username, url) DO UPDATE SET alias = excluded.alias",
                (username, alias, url),
            )?;
            Ok(())
        })
    }

    pub fn unfollow(&self, username: &str, url: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM follows WHERE username = ?1 AND url = ?2", (username, url))?;
            Ok(n > 0)
        })
    }

    pub fn get_following(&self, username: &str) -> Result<Vec<FollowRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT alias, url FROM follows WHERE username = ?1 ORDER BY alias")?;
            let rows = stmt
                .query_map([username], |row| {
                    Ok(FollowRow {
                        alias: row.get(0)?,
                        url: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Every followed feed URL with the local users following it.
    pub fn get_followed_feeds(&self) -> Result<BTreeMap<String, Vec<String>>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT url, username FROM follows ORDER BY url, username")?;
            let mut rows = stmt.query([])?;
            let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
            while let Some(row) = rows.next()? {
                out.entry(row.get(0)?).or_default().push(row.get(1)?);
            }
            Ok(out)
        })
    }

    // -- Mutes --

    pub fn mute(&self, username: &str, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("INSERT OR IGNORE INTO mutes (username, key) VALUES (?1, ?2)", (username, key))?;
            Ok(())
        })
    }

    pub fn unmute(&self, username: &str, key: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM mutes WHERE username = ?1 AND key = ?2", (username, key))?;
            Ok(())
        })
    }

    pub fn get_muted(&self, username: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key FROM mutes WHERE username = ?1 ORDER BY key")?;
            let rows = stmt
                .query_map([username], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(rows)
        })
    }

    // -- Sessions --

    pub fn create_session(&self, id: &str, username: &str, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, username, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                (id, username, ts(now), ts(expires_at)),
            )?;
            Ok(())
        })
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, username, created_at, expires_at FROM sessions WHERE id = ?1",
                [id],
                |row| {
                    Ok(SessionRow {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        created_at: parse_ts(row, 2)?,
                        expires_at: parse_ts(row, 3)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Drop sessions that expired before `now`. Returns how many went.
    pub fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM sessions WHERE expires_at < ?1", [ts(now)])?;
            Ok(n)
        })
    }
}

// -- Row mapping --

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn user_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        username: row.get(0)?,
        tagline: row.get(1)?,
        avatar_hash: row.get(2)?,
        is_admin: row.get(3)?,
        created_at: parse_ts(row, 4)?,
        last_seen_at: parse_ts(row, 5)?,
    })
}

fn feed_row(row: &Row<'_>) -> rusqlite::Result<FeedRow> {
    Ok(FeedRow {
        name: row.get(0)?,
        owner: row.get(1)?,
        description: row.get(2)?,
        created_at: parse_ts(row, 3)?,
    })
}

fn query_user(conn: &Connection, username: &str) -> Result<Option<UserRow>> {
    conn.query_row(
        "SELECT username, tagline, avatar_hash, is_admin, created_at, last_seen_at FROM users WHERE username = ?1",
        [username],
        user_row,
    )
    .optional()
}

trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
