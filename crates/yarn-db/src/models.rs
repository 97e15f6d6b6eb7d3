//! Database row types. These map directly to SQLite rows and stay
//! independent of the twtxt model.
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct UserRow {
    pub username: String,
    pub tagline: String,
    pub avatar_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FeedRow {
    pub name: String,
    pub owner: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowRow {
    pub alias: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
