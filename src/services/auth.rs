use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::types::SessionId;
use crate::models::user::{SessionRecord, UserRecord};
use crate::store::UserStore;
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use password_hash::rand_core::OsRng;
use password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use regex::Regex;
use std::sync::Arc;

static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_]{2,15}$").expect("username regex"));

/// Reset the failure counter after this much quiet time.
const ATTEMPT_RESET: Duration = Duration::hours(1);

#[derive(Debug, Clone)]
struct LoginAttempt {
    failed_count: u32,
    last_attempt: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct TempClaim {
    username: String,
    session_id: SessionId,
    expires_at: DateTime<Utc>,
}

/// A token successfully restored into a session identity.
#[derive(Debug, Clone)]
pub struct RestoredSession {
    pub session_id: SessionId,
    pub username: String,
    pub current_path: String,
    pub temporary: bool,
}

/// Password hashing, login throttling and session tokens. Tokens for
/// temporary users live only in memory and expire quickly; everyone else
/// gets a persisted session row.
pub struct AuthService {
    store: Arc<dyn UserStore>,
    config: Arc<Config>,
    argon: Argon2<'static>,
    attempts: DashMap<String, LoginAttempt>,
    temp_tokens: DashMap<String, TempClaim>,
}

impl AuthService {
    pub fn new(store: Arc<dyn UserStore>, config: Arc<Config>) -> Self {
        Self {
            store,
            config,
            argon: Argon2::default(),
            attempts: DashMap::new(),
            temp_tokens: DashMap::new(),
        }
    }

    pub fn valid_username(name: &str) -> bool {
        USERNAME_RE.is_match(name)
    }

    pub async fn register(&self, username: &str, password: &str, ip: &str) -> AppResult<()> {
        if !Self::valid_username(username) {
            return Err(AppError::Validation {
                field: "username",
                message: "3-16 characters, letters, digits and _, starting with a letter".into(),
            });
        }
        if password.len() < 4 {
            return Err(AppError::Validation {
                field: "password",
                message: "at least 4 characters".into(),
            });
        }
        let now = Utc::now();
        if self.store.is_banned(ip, now).await? {
            return Err(AppError::PermissionDenied);
        }
        let recent = self
            .store
            .registration_attempts_since(ip, now - ATTEMPT_RESET)
            .await?;
        if recent >= self.config.authentication.max_registrations_per_hour {
            return Err(AppError::Capacity(
                "too many registrations from this address, try again later".into(),
            ));
        }
        self.store.record_registration_attempt(ip, now).await?;

        let hash = self.hash_password(password)?;
        let created = self
            .store
            .create_user(UserRecord {
                username: username.to_string(),
                password_hash: hash,
                created_at: now,
                ip_address: ip.to_string(),
            })
            .await?;
        if !created {
            return Err(AppError::Validation {
                field: "username",
                message: "that name is taken".into(),
            });
        }
        tracing::info!(%username, %ip, "user registered");
        Ok(())
    }

    /// Verify credentials under the per-IP lockout policy. Failures are
    /// opaque until the lockout engages, then the user sees a countdown.
    pub async fn login(&self, username: &str, password: &str, ip: &str) -> AppResult<()> {
        self.check_lockout(ip)?;
        let Some(user) = self.store.get_user(username).await? else {
            self.record_failure(ip);
            return Err(AppError::InvalidCredentials);
        };
        if self.verify_password(password, &user.password_hash).is_err() {
            self.record_failure(ip);
            return Err(AppError::InvalidCredentials);
        }
        self.attempts.remove(ip);
        Ok(())
    }

    pub async fn change_password(&self, username: &str, current: &str, new: &str) -> AppResult<()> {
        let Some(user) = self.store.get_user(username).await? else {
            return Err(AppError::InvalidCredentials);
        };
        self.verify_password(current, &user.password_hash)
            .map_err(|_| AppError::InvalidCredentials)?;
        if new.len() < 4 {
            return Err(AppError::Validation {
                field: "password",
                message: "at least 4 characters".into(),
            });
        }
        let hash = self.hash_password(new)?;
        self.store.update_password(username, &hash).await?;
        Ok(())
    }

    fn hash_password(&self, password: &str) -> AppResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        Ok(self
            .argon
            .hash_password(password.as_bytes(), &salt)?
            .to_string())
    }

    fn verify_password(&self, password: &str, hash: &str) -> Result<(), password_hash::Error> {
        let parsed = PasswordHash::new(hash)?;
        self.argon.verify_password(password.as_bytes(), &parsed)
    }

    fn check_lockout(&self, ip: &str) -> AppResult<()> {
        let now = Utc::now();
        if let Some(mut entry) = self.attempts.get_mut(ip) {
            if let Some(until) = entry.locked_until {
                if until > now {
                    return Err(AppError::LockedOut {
                        seconds_left: (until - now).num_seconds().max(1),
                    });
                }
                entry.locked_until = None;
                entry.failed_count = 0;
            }
            if now - entry.last_attempt > ATTEMPT_RESET {
                entry.failed_count = 0;
            }
        }
        Ok(())
    }

    fn record_failure(&self, ip: &str) {
        let now = Utc::now();
        let max = self.config.authentication.max_failed_login_attempts;
        let lockout =
            Duration::seconds(self.config.authentication.login_lockout_duration_seconds as i64);
        let mut entry = self.attempts.entry(ip.to_string()).or_insert(LoginAttempt {
            failed_count: 0,
            last_attempt: now,
            locked_until: None,
        });
        if now - entry.last_attempt > ATTEMPT_RESET {
            entry.failed_count = 0;
        }
        entry.failed_count += 1;
        entry.last_attempt = now;
        if entry.failed_count >= max {
            entry.locked_until = Some(now + lockout);
            tracing::warn!(%ip, failures = entry.failed_count, "IP locked out after failed logins");
        }
    }

    /// Issue a session token. Persistent users get a session row and a
    /// token that names it; temporary users get a random in-memory claim
    /// with a short TTL and nothing is written through the store.
    pub async fn issue_token(
        &self,
        session_id: &SessionId,
        username: &str,
        ip: &str,
        current_path: &str,
    ) -> AppResult<String> {
        if self.config.is_temporary_user(username) {
            let token = uuid::Uuid::new_v4().simple().to_string();
            let ttl = Duration::minutes(self.config.limits.temp_token_ttl_minutes);
            self.temp_tokens.insert(
                token.clone(),
                TempClaim {
                    username: username.to_string(),
                    session_id: session_id.clone(),
                    expires_at: Utc::now() + ttl,
                },
            );
            return Ok(token);
        }
        let now = Utc::now();
        self.store
            .save_session(SessionRecord {
                session_id: session_id.to_string(),
                username: username.to_string(),
                ip_address: ip.to_string(),
                created_at: now,
                last_activity: now,
                current_path: current_path.to_string(),
            })
            .await?;
        Ok(session_id.to_string())
    }

    /// Restore a token into an identity. Expired or unknown tokens yield
    /// `None`; callers fall back to a fresh guest session.
    pub async fn restore(&self, token: &str) -> AppResult<Option<RestoredSession>> {
        let now = Utc::now();
        if let Some((_, claim)) = self.temp_tokens.remove(token) {
            if claim.expires_at <= now {
                return Ok(None);
            }
            return Ok(Some(RestoredSession {
                session_id: claim.session_id,
                username: claim.username.clone(),
                current_path: format!("/home/{}", claim.username),
                temporary: true,
            }));
        }
        let Some(row) = self.store.load_session(token).await? else {
            return Ok(None);
        };
        let max_age = Duration::hours(self.config.limits.session_expiry_hours);
        if now - row.last_activity > max_age {
            self.store.delete_session(token).await?;
            return Ok(None);
        }
        Ok(Some(RestoredSession {
            session_id: SessionId(row.session_id),
            username: row.username,
            current_path: row.current_path,
            temporary: false,
        }))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn service() -> AuthService {
        let mut config = Config::default();
        config.authentication.max_failed_login_attempts = 3;
        config.authentication.login_lockout_duration_seconds = 60;
        AuthService::new(Arc::new(MemoryStore::new()), Arc::new(config))
    }

    #[test]
    fn username_validation() {
        assert!(AuthService::valid_username("ada"));
        assert!(AuthService::valid_username("ada_95"));
        assert!(!AuthService::valid_username("a"));
        assert!(!AuthService::valid_username("9lives"));
        assert!(!AuthService::valid_username("has space"));
    }

    #[tokio::test]
    async fn register_then_login() {
        let auth = service();
        auth.register("ada", "secret", "10.0.0.1").await.unwrap();
        auth.login("ada", "secret", "10.0.0.1").await.unwrap();
        assert!(matches!(
            auth.login("ada", "wrong", "10.0.0.1").await,
            Err(AppError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn lockout_after_repeated_failures() {
        let auth = service();
        auth.register("ada", "secret", "10.0.0.1").await.unwrap();
        for _ in 0..3 {
            let _ = auth.login("ada", "wrong", "10.0.0.9").await;
        }
        // Even the right password is refused while locked, with a countdown
        assert!(matches!(
            auth.login("ada", "secret", "10.0.0.9").await,
            Err(AppError::LockedOut { .. })
        ));
        // Another IP is unaffected
        auth.login("ada", "secret", "10.0.0.2").await.unwrap();
    }

    #[tokio::test]
    async fn temporary_user_tokens_are_not_persisted() {
        let store = Arc::new(MemoryStore::new());
        let config = Arc::new(Config::default());
        let auth = AuthService::new(store.clone(), config);
        let sid = SessionId::new();
        let token = auth
            .issue_token(&sid, "dyson", "10.0.0.1", "/home/dyson")
            .await
            .unwrap();
        // No session row was written
        assert!(store.load_session(&token).await.unwrap().is_none());
        let restored = auth.restore(&token).await.unwrap().unwrap();
        assert!(restored.temporary);
        assert_eq!(restored.username, "dyson");
        // Temp tokens are single-use
        assert!(auth.restore(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_temp_token_yields_fresh_guest_path() {
        let store = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.limits.temp_token_ttl_minutes = 0;
        let auth = AuthService::new(store, Arc::new(config));
        let token = auth
            .issue_token(&SessionId::new(), "dyson", "ip", "/home/dyson")
            .await
            .unwrap();
        assert!(auth.restore(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn persistent_token_round_trip() {
        let auth = service();
        auth.register("ada", "secret", "ip").await.unwrap();
        let token = auth
            .issue_token(&SessionId::new(), "ada", "ip", "/home/ada")
            .await
            .unwrap();
        let restored = auth.restore(&token).await.unwrap().unwrap();
        assert!(!restored.temporary);
        assert_eq!(restored.username, "ada");
    }
}
