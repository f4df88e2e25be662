use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// Session id unknown or expired
    #[error("no such session")]
    NoSession,

    #[error("not logged in")]
    NotLoggedIn,

    #[error("Not found")]
    NotFound,

    /// A per-session or system-wide cap was hit; nothing was mutated
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// A deadline-bounded lock acquisition timed out
    #[error("temporarily unavailable: {0}")]
    Unavailable(&'static str),

    #[error("permission denied")]
    PermissionDenied,

    #[error("validation failed: {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("invalid credentials")]
    InvalidCredentials,

    /// IP is locked out after too many failed logins
    #[error("account locked, retry in {seconds_left}s")]
    LockedOut { seconds_left: i64 },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Password(#[from] password_hash::Error),

    #[error("internal error: {0}")]
    InternalError(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read file: {0}")]
    Read(std::io::Error),

    #[error("failed to parse file: {0}")]
    Parse(Box<toml::de::Error>),

    #[error("invalid telnet server entry `{key}`: expected `Display Name|host:port`")]
    TelnetEntry { key: String },
}
