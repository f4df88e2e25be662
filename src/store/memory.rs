use crate::error::AppResult;
use crate::models::user::{ChatUsage, SessionRecord, UserRecord, VirtualFile};
use crate::store::{FileStore, UserStore};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// In-memory implementation of both store traits. Keys mirror the
/// relational schema so a database-backed implementation can swap in
/// without touching the services.
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, UserRecord>>,
    sessions: RwLock<HashMap<String, SessionRecord>>,
    bans: RwLock<HashMap<String, DateTime<Utc>>>,
    registrations: RwLock<Vec<(String, DateTime<Utc>)>>,
    env_vars: RwLock<HashMap<String, String>>,
    chat_usage: RwLock<HashMap<(String, NaiveDate), ChatUsage>>,
    files: RwLock<HashMap<(String, String), VirtualFile>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl UserStore for MemoryStore {
    async fn create_user(&self, user: UserRecord) -> AppResult<bool> {
        let mut users = self.users.write();
        let key = user.username.to_lowercase();
        if users.contains_key(&key) {
            return Ok(false);
        }
        users.insert(key, user);
        Ok(true)
    }

    async fn get_user(&self, username: &str) -> AppResult<Option<UserRecord>> {
        Ok(self.users.read().get(&username.to_lowercase()).cloned())
    }

    async fn update_password(&self, username: &str, password_hash: &str) -> AppResult<()> {
        if let Some(u) = self.users.write().get_mut(&username.to_lowercase()) {
            u.password_hash = password_hash.to_string();
        }
        Ok(())
    }

    async fn save_session(&self, record: SessionRecord) -> AppResult<()> {
        self.sessions.write().insert(record.session_id.clone(), record);
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> AppResult<Option<SessionRecord>> {
        Ok(self.sessions.read().get(session_id).cloned())
    }

    async fn delete_session(&self, session_id: &str) -> AppResult<()> {
        self.sessions.write().remove(session_id);
        Ok(())
    }

    async fn touch_session(
        &self,
        session_id: &str,
        last_activity: DateTime<Utc>,
        current_path: &str,
    ) -> AppResult<()> {
        if let Some(s) = self.sessions.write().get_mut(session_id) {
            s.last_activity = last_activity;
            s.current_path = current_path.to_string();
        }
        Ok(())
    }

    async fn is_banned(&self, identifier: &str, now: DateTime<Utc>) -> AppResult<bool> {
        Ok(self.bans.read().get(identifier).is_some_and(|expiry| *expiry > now))
    }

    async fn ban(&self, identifier: &str, expiry: DateTime<Utc>) -> AppResult<()> {
        self.bans.write().insert(identifier.to_string(), expiry);
        Ok(())
    }

    async fn record_registration_attempt(&self, ip: &str, at: DateTime<Utc>) -> AppResult<()> {
        self.registrations.write().push((ip.to_string(), at));
        Ok(())
    }

    async fn registration_attempts_since(&self, ip: &str, since: DateTime<Utc>) -> AppResult<u32> {
        Ok(self
            .registrations
            .read()
            .iter()
            .filter(|(i, at)| i == ip && *at >= since)
            .count() as u32)
    }

    async fn get_env_var(&self, name: &str) -> AppResult<Option<String>> {
        Ok(self.env_vars.read().get(name).cloned())
    }

    async fn set_env_var(&self, name: &str, value: &str) -> AppResult<()> {
        self.env_vars.write().insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn chat_usage(&self, username: &str, date: NaiveDate) -> AppResult<Option<ChatUsage>> {
        Ok(self.chat_usage.read().get(&(username.to_lowercase(), date)).cloned())
    }

    async fn record_chat_usage(&self, usage: ChatUsage) -> AppResult<()> {
        self.chat_usage
            .write()
            .insert((usage.username.to_lowercase(), usage.date), usage);
        Ok(())
    }
}

#[async_trait::async_trait]
impl FileStore for MemoryStore {
    async fn read(&self, username: &str, path: &str) -> AppResult<Option<VirtualFile>> {
        Ok(self.files.read().get(&(username.to_string(), path.to_string())).cloned())
    }

    async fn write(&self, file: VirtualFile) -> AppResult<()> {
        self.files
            .write()
            .insert((file.username.clone(), file.path.clone()), file);
        Ok(())
    }

    async fn list(&self, username: &str, dir: &str) -> AppResult<Vec<VirtualFile>> {
        let prefix = if dir.ends_with('/') {
            dir.to_string()
        } else {
            format!("{dir}/")
        };
        let files = self.files.read();
        let mut out: Vec<VirtualFile> = files
            .iter()
            .filter(|((u, p), _)| {
                u == username
                    && p.starts_with(&prefix)
                    && !p[prefix.len()..].is_empty()
                    && !p[prefix.len()..].contains('/')
            })
            .map(|(_, f)| f.clone())
            .collect();
        out.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then(a.path.cmp(&b.path)));
        Ok(out)
    }

    async fn remove(&self, username: &str, path: &str) -> AppResult<bool> {
        Ok(self
            .files
            .write()
            .remove(&(username.to_string(), path.to_string()))
            .is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(user: &str, path: &str, is_dir: bool) -> VirtualFile {
        VirtualFile {
            username: user.into(),
            path: path.into(),
            content: String::new(),
            is_dir,
            mod_time: Utc::now(),
        }
    }

    #[tokio::test]
    async fn list_returns_direct_children_dirs_first() {
        let store = MemoryStore::new();
        store.write(file("ada", "/home/ada/b.txt", false)).await.unwrap();
        store.write(file("ada", "/home/ada/sub", true)).await.unwrap();
        store.write(file("ada", "/home/ada/sub/deep.txt", false)).await.unwrap();

        let ls = store.list("ada", "/home/ada").await.unwrap();
        let paths: Vec<&str> = ls.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["/home/ada/sub", "/home/ada/b.txt"]);
    }

    #[tokio::test]
    async fn ban_expiry_is_checked() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.ban("1.2.3.4", now + chrono::Duration::minutes(5)).await.unwrap();
        assert!(store.is_banned("1.2.3.4", now).await.unwrap());
        assert!(!store.is_banned("1.2.3.4", now + chrono::Duration::minutes(6)).await.unwrap());
    }
}
