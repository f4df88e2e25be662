use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::user::ChatUsage;
use crate::state::session::ChatEntry;
use crate::store::UserStore;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

/// External AI collaborator. The core only sees this trait.
#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    async fn complete(&self, history: &[ChatEntry], api_key: Option<&str>) -> AppResult<String>;
}

/// Backend used when no API key is configured.
pub struct OfflineChatBackend;

#[async_trait::async_trait]
impl ChatBackend for OfflineChatBackend {
    async fn complete(&self, _history: &[ChatEntry], api_key: Option<&str>) -> AppResult<String> {
        if api_key.is_none() {
            return Ok("The chat assistant is offline: no API key is configured.".into());
        }
        Ok("The chat assistant is not available right now.".into())
    }
}

#[derive(Debug)]
struct RateWindow {
    count: u32,
    window_start: DateTime<Utc>,
}

/// Chat with per-IP rate limiting (over the hard threshold the IP gets
/// banned through the store) and a per-user daily time budget.
pub struct ChatService {
    backend: Arc<dyn ChatBackend>,
    store: Arc<dyn UserStore>,
    config: Arc<Config>,
    windows: DashMap<String, RateWindow>,
}

impl ChatService {
    pub fn new(backend: Arc<dyn ChatBackend>, store: Arc<dyn UserStore>, config: Arc<Config>) -> Self {
        Self {
            backend,
            store,
            config,
            windows: DashMap::new(),
        }
    }

    pub async fn chat(
        &self,
        username: &str,
        ip: &str,
        history: &[ChatEntry],
    ) -> AppResult<String> {
        let now = Utc::now();
        if self.store.is_banned(ip, now).await? {
            return Err(AppError::PermissionDenied);
        }
        self.check_rate(ip, now).await?;
        self.check_usage(username, now).await?;

        let started = std::time::Instant::now();
        let reply = self
            .backend
            .complete(history, self.config.secrets.ai_key.as_deref())
            .await?;
        self.record_usage(username, now, started.elapsed().as_secs() as i64 + 1)
            .await?;
        Ok(reply)
    }

    pub async fn usage_today(&self, username: &str) -> AppResult<i64> {
        Ok(self
            .store
            .chat_usage(username, Utc::now().date_naive())
            .await?
            .map(|u| u.time_used)
            .unwrap_or(0))
    }

    pub fn daily_budget(&self) -> i64 {
        self.config.chat_rate_limit.daily_usage_seconds
    }

    async fn check_rate(&self, ip: &str, now: DateTime<Utc>) -> AppResult<()> {
        let cfg = &self.config.chat_rate_limit;
        let reset = Duration::seconds(cfg.rate_limit_reset_interval as i64);
        // Count under the entry guard, act after it is released
        let count = {
            let mut w = self.windows.entry(ip.to_string()).or_insert(RateWindow {
                count: 0,
                window_start: now,
            });
            if now - w.window_start > reset {
                w.count = 0;
                w.window_start = now;
            }
            w.count += 1;
            w.count
        };
        if count > cfg.max_requests_per_minute_ban {
            let expiry = now + Duration::seconds(cfg.rate_limit_duration as i64);
            self.store.ban(ip, expiry).await?;
            tracing::warn!(%ip, count, "chat flood, banning IP");
            return Err(AppError::PermissionDenied);
        }
        if count > cfg.max_requests_per_minute {
            return Err(AppError::Capacity(
                "chat rate limit reached, slow down".into(),
            ));
        }
        Ok(())
    }

    async fn check_usage(&self, username: &str, now: DateTime<Utc>) -> AppResult<()> {
        let used = self
            .store
            .chat_usage(username, now.date_naive())
            .await?
            .map(|u| u.time_used)
            .unwrap_or(0);
        if used >= self.config.chat_rate_limit.daily_usage_seconds {
            return Err(AppError::Capacity(
                "daily chat budget is used up, come back tomorrow".into(),
            ));
        }
        Ok(())
    }

    async fn record_usage(&self, username: &str, now: DateTime<Utc>, seconds: i64) -> AppResult<()> {
        let date = now.date_naive();
        let prior = self.store.chat_usage(username, date).await?;
        let usage = ChatUsage {
            username: username.to_string(),
            date,
            time_used: prior.as_ref().map(|u| u.time_used).unwrap_or(0) + seconds,
            last_session_start: prior.and_then(|u| u.last_session_start).or(Some(now)),
        };
        self.store.record_chat_usage(usage).await
    }
}
