use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Fallback used when no token secret is present in the environment. Its
/// value is deliberately recognisable in logs and tokens.
pub const INSECURE_SECRET: &str = "INSECURE-DEV-SECRET";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub debug: DebugConfig,
    pub authentication: AuthConfig,
    pub chat_rate_limit: ChatRateLimitConfig,
    pub limits: LimitsConfig,
    /// `key = "Display Name|host:port"` entries
    pub telnet_servers: HashMap<String, String>,
    /// Usernames whose sessions are never persisted and whose tokens
    /// expire quickly
    pub temporary_users: Vec<String>,

    #[serde(skip)]
    pub secrets: Secrets,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub max_failed_login_attempts: u32,
    pub login_lockout_duration_seconds: u64,
    /// Registration attempts allowed per IP per hour
    pub max_registrations_per_hour: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChatRateLimitConfig {
    pub max_requests_per_minute: u32,
    pub max_requests_per_minute_ban: u32,
    pub rate_limit_duration: u64,
    pub rate_limit_reset_interval: u64,
    /// Daily chat time budget per user, seconds
    pub daily_usage_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_basic_sessions: usize,
    pub max_guest_basic_sessions: usize,
    pub max_telnet_sessions: usize,
    pub session_expiry_hours: i64,
    pub temp_token_ttl_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct Secrets {
    pub token_secret: String,
    pub ai_key: Option<String>,
    /// True when the token secret came from the insecure fallback
    pub insecure: bool,
}

/// One parsed `[telnet_servers]` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelnetServer {
    pub key: String,
    pub display_name: String,
    pub host_port: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self { log_level: "info".into() }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_failed_login_attempts: 5,
            login_lockout_duration_seconds: 300,
            max_registrations_per_hour: 3,
        }
    }
}

impl Default for ChatRateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 10,
            max_requests_per_minute_ban: 30,
            rate_limit_duration: 60,
            rate_limit_reset_interval: 60,
            daily_usage_seconds: 1800,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_basic_sessions: 20,
            max_guest_basic_sessions: 5,
            max_telnet_sessions: 10,
            session_expiry_hours: 24,
            temp_token_ttl_minutes: 15,
        }
    }
}

impl Default for Secrets {
    fn default() -> Self {
        Self {
            token_secret: INSECURE_SECRET.into(),
            ai_key: None,
            insecure: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: DebugConfig::default(),
            authentication: AuthConfig::default(),
            chat_rate_limit: ChatRateLimitConfig::default(),
            limits: LimitsConfig::default(),
            telnet_servers: HashMap::new(),
            temporary_users: vec!["dyson".into()],
            secrets: Secrets::default(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        let mut cfg: Self = toml::from_str(&data).map_err(|e| ConfigError::Parse(Box::new(e)))?;
        cfg.read_secrets();
        Ok(cfg)
    }

    pub fn from_env() -> Self {
        let _ = dotenvy::from_filename(".env");
        let mut cfg = std::env::var("RETROTERM_CONFIG")
            .ok()
            .and_then(|p| Self::load(&p).ok())
            .unwrap_or_default();
        cfg.read_secrets();
        cfg
    }

    /// Secrets only ever come from the process environment. Missing secrets
    /// are a security warning, not an error: the system keeps running with a
    /// flagged fallback.
    fn read_secrets(&mut self) {
        let _ = dotenvy::from_filename(".env");
        match std::env::var("RETROTERM_TOKEN_SECRET") {
            Ok(s) if !s.is_empty() => {
                self.secrets.token_secret = s;
                self.secrets.insecure = false;
            }
            _ => {
                tracing::warn!("RETROTERM_TOKEN_SECRET not set, using insecure fallback");
                self.secrets.token_secret = INSECURE_SECRET.into();
                self.secrets.insecure = true;
            }
        }
        self.secrets.ai_key = std::env::var("RETROTERM_AI_KEY").ok().filter(|s| !s.is_empty());
        if self.secrets.ai_key.is_none() {
            tracing::warn!("RETROTERM_AI_KEY not set, chat backend disabled");
        }
    }

    /// Look up and parse a `[telnet_servers]` entry by key.
    pub fn telnet_server(&self, key: &str) -> Option<TelnetServer> {
        let raw = self.telnet_servers.get(key)?;
        TelnetServer::parse(key, raw).ok()
    }

    pub fn telnet_server_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.telnet_servers.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_temporary_user(&self, username: &str) -> bool {
        self.temporary_users.iter().any(|u| u.eq_ignore_ascii_case(username))
    }
}

impl TelnetServer {
    pub fn parse(key: &str, raw: &str) -> Result<Self, ConfigError> {
        let (display, host_port) = raw.split_once('|').ok_or_else(|| ConfigError::TelnetEntry {
            key: key.to_string(),
        })?;
        let display = display.trim();
        let host_port = host_port.trim();
        if display.is_empty() || host_port.is_empty() || !host_port.contains(':') {
            return Err(ConfigError::TelnetEntry { key: key.to_string() });
        }
        Ok(Self {
            key: key.to_string(),
            display_name: display.to_string(),
            host_port: host_port.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn telnet_entry_parses() {
        let s = TelnetServer::parse("mapscii", "MapSCII World Map|mapscii.me:23").unwrap();
        assert_eq!(s.display_name, "MapSCII World Map");
        assert_eq!(s.host_port, "mapscii.me:23");
    }

    #[test]
    fn telnet_entry_rejects_missing_port() {
        assert!(TelnetServer::parse("bad", "Just A Name|nohost").is_err());
        assert!(TelnetServer::parse("bad", "nopipe:23").is_err());
    }

    #[test]
    fn config_sections_parse() {
        let cfg: Config = toml::from_str(
            r#"
            [debug]
            log_level = "debug"

            [authentication]
            max_failed_login_attempts = 3
            login_lockout_duration_seconds = 120

            [chat_rate_limit]
            max_requests_per_minute = 4

            [telnet_servers]
            mapscii = "MapSCII|mapscii.me:23"
        "#,
        )
        .unwrap();
        assert_eq!(cfg.authentication.max_failed_login_attempts, 3);
        assert_eq!(cfg.chat_rate_limit.max_requests_per_minute, 4);
        assert!(cfg.telnet_server("mapscii").is_some());
        assert!(cfg.is_temporary_user("Dyson"));
    }
}
