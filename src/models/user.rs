use chrono::{DateTime, NaiveDate, Utc};

/// A registered user row.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub ip_address: String,
}

/// A persisted session row. Temporary users never get one of these.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub username: String,
    pub ip_address: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub current_path: String,
}

/// A virtual filesystem entry, keyed by (username, path).
#[derive(Debug, Clone)]
pub struct VirtualFile {
    pub username: String,
    pub path: String,
    pub content: String,
    pub is_dir: bool,
    pub mod_time: DateTime<Utc>,
}

/// Daily chat usage accounting, keyed by (username, date).
#[derive(Debug, Clone)]
pub struct ChatUsage {
    pub username: String,
    pub date: NaiveDate,
    pub time_used: i64,
    pub last_session_start: Option<DateTime<Utc>>,
}
