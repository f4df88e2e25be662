pub mod memory;

use crate::error::AppResult;
use crate::models::user::{ChatUsage, SessionRecord, UserRecord, VirtualFile};
use chrono::{DateTime, NaiveDate, Utc};

/// User, session, ban, registration-attempt, env-var and chat-usage
/// persistence. The relational implementation lives outside the core;
/// [`memory::MemoryStore`] backs the binary and the tests.
#[async_trait::async_trait]
pub trait UserStore: Send + Sync {
    /// Returns false when the name is already taken.
    async fn create_user(&self, user: UserRecord) -> AppResult<bool>;
    async fn get_user(&self, username: &str) -> AppResult<Option<UserRecord>>;
    async fn update_password(&self, username: &str, password_hash: &str) -> AppResult<()>;

    async fn save_session(&self, record: SessionRecord) -> AppResult<()>;
    async fn load_session(&self, session_id: &str) -> AppResult<Option<SessionRecord>>;
    async fn delete_session(&self, session_id: &str) -> AppResult<()>;
    async fn touch_session(
        &self,
        session_id: &str,
        last_activity: DateTime<Utc>,
        current_path: &str,
    ) -> AppResult<()>;

    async fn is_banned(&self, identifier: &str, now: DateTime<Utc>) -> AppResult<bool>;
    async fn ban(&self, identifier: &str, expiry: DateTime<Utc>) -> AppResult<()>;

    async fn record_registration_attempt(&self, ip: &str, at: DateTime<Utc>) -> AppResult<()>;
    async fn registration_attempts_since(&self, ip: &str, since: DateTime<Utc>) -> AppResult<u32>;

    async fn get_env_var(&self, name: &str) -> AppResult<Option<String>>;
    async fn set_env_var(&self, name: &str, value: &str) -> AppResult<()>;

    async fn chat_usage(&self, username: &str, date: NaiveDate) -> AppResult<Option<ChatUsage>>;
    async fn record_chat_usage(&self, usage: ChatUsage) -> AppResult<()>;
}

/// Virtual-file persistence, keyed by (username, path).
#[async_trait::async_trait]
pub trait FileStore: Send + Sync {
    async fn read(&self, username: &str, path: &str) -> AppResult<Option<VirtualFile>>;
    async fn write(&self, file: VirtualFile) -> AppResult<()>;
    /// Direct children of `dir`, dirs first, then by name.
    async fn list(&self, username: &str, dir: &str) -> AppResult<Vec<VirtualFile>>;
    /// Returns false when nothing was removed.
    async fn remove(&self, username: &str, path: &str) -> AppResult<bool>;
}
