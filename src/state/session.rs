use crate::models::types::{SessionId, TerminalDims};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const GUEST_USERNAME: &str = "guest";

/// Selects exactly one subsystem to receive this session's input.
/// At most one non-shell mode is active at a time; transitions happen
/// under the session lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    OsShell,
    Editor,
    Chess,
    Telnet,
    Pager,
    LoginProcess,
    RegistrationProcess,
    PasswordChange,
    BasicInterpreter,
    Board,
}

impl InputMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputMode::OsShell => "shell",
            InputMode::Editor => "editor",
            InputMode::Chess => "chess",
            InputMode::Telnet => "telnet",
            InputMode::Pager => "pager",
            InputMode::LoginProcess => "login",
            InputMode::RegistrationProcess => "registration",
            InputMode::PasswordChange => "password",
            InputMode::BasicInterpreter => "basic",
            InputMode::Board => "board",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEntry {
    pub role: ChatRole,
    pub content: String,
    pub time: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub username: String,
    pub ip_address: String,
    pub current_path: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub dims: TerminalDims,
    pub input_mode: InputMode,
    pub chat_history: Vec<ChatEntry>,
}

impl Session {
    pub fn new_guest(ip_address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            username: GUEST_USERNAME.to_string(),
            ip_address: ip_address.into(),
            current_path: format!("/home/{GUEST_USERNAME}"),
            created_at: now,
            last_activity: now,
            dims: TerminalDims::default(),
            input_mode: InputMode::OsShell,
            chat_history: Vec::new(),
        }
    }

    pub fn is_guest(&self) -> bool {
        self.username == GUEST_USERNAME
    }

    pub fn home_path(&self) -> String {
        format!("/home/{}", self.username)
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    pub fn push_chat(&mut self, role: ChatRole, content: impl Into<String>) {
        self.chat_history.push(ChatEntry {
            role,
            content: content.into(),
            time: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_starts_in_shell_mode() {
        let s = Session::new_guest("127.0.0.1");
        assert_eq!(s.input_mode, InputMode::OsShell);
        assert!(s.is_guest());
        assert_eq!(s.dims, TerminalDims { cols: 80, rows: 24 });
        assert_eq!(s.current_path, "/home/guest");
    }
}
