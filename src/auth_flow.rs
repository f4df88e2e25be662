use crate::error::AppError;
use crate::input::is_exit_key;
use crate::models::message::Message;
use crate::models::types::SessionId;
use crate::services::auth::AuthService;
use dashmap::DashMap;
use std::sync::Arc;

/// What an interactive auth flow step produced. The router applies the
/// session-level consequences (mode reset, identity change).
#[derive(Debug)]
pub enum FlowEvent {
    Continue(Vec<Message>),
    Exit(Vec<Message>),
    LoggedIn { username: String, messages: Vec<Message> },
    Registered { username: String, messages: Vec<Message> },
    PasswordChanged { messages: Vec<Message> },
}

#[derive(Default)]
struct LoginFlow {
    username: Option<String>,
}

#[derive(Default)]
struct RegistrationFlow {
    username: Option<String>,
    password: Option<String>,
}

#[derive(Default)]
struct PasswordFlow {
    current: Option<String>,
}

/// The multi-step login, registration and password-change conversations.
/// Each flow keeps its per-session state in its own map so releasing one
/// never touches the others.
pub struct AuthFlows {
    auth: Arc<AuthService>,
    logins: DashMap<SessionId, LoginFlow>,
    registrations: DashMap<SessionId, RegistrationFlow>,
    passwords: DashMap<SessionId, PasswordFlow>,
}

impl AuthFlows {
    pub fn new(auth: Arc<AuthService>) -> Self {
        Self {
            auth,
            logins: DashMap::new(),
            registrations: DashMap::new(),
            passwords: DashMap::new(),
        }
    }

    pub fn clear(&self, id: &SessionId) {
        self.logins.remove(id);
        self.registrations.remove(id);
        self.passwords.remove(id);
    }

    pub fn has_any(&self, id: &SessionId) -> bool {
        self.logins.contains_key(id)
            || self.registrations.contains_key(id)
            || self.passwords.contains_key(id)
    }

    // ── login ───────────────────────────────────────────────────────────

    pub fn begin_login(&self, id: &SessionId) -> Vec<Message> {
        self.logins.insert(id.clone(), LoginFlow::default());
        vec![
            Message::input_control("password:off"),
            Message::prompt("Username: "),
        ]
    }

    pub async fn handle_login(&self, id: &SessionId, input: &str, ip: &str) -> FlowEvent {
        if is_exit_key(input) {
            self.logins.remove(id);
            return FlowEvent::Exit(vec![Message::text("Login cancelled.")]);
        }
        let pending_username = match self.logins.get(id) {
            Some(flow) => flow.username.clone(),
            None => return FlowEvent::Exit(vec![]),
        };
        match pending_username {
            None => {
                let username = input.trim().to_string();
                if username.is_empty() {
                    return FlowEvent::Continue(vec![Message::prompt("Username: ")]);
                }
                if let Some(mut flow) = self.logins.get_mut(id) {
                    flow.username = Some(username);
                }
                FlowEvent::Continue(vec![
                    Message::input_control("password:on"),
                    Message::prompt("Password: "),
                ])
            }
            Some(username) => {
                self.logins.remove(id);
                match self.auth.login(&username, input.trim(), ip).await {
                    Ok(()) => FlowEvent::LoggedIn {
                        username: username.clone(),
                        messages: vec![
                            Message::input_control("password:off"),
                            Message::text(format!("Welcome back, {username}.")),
                        ],
                    },
                    Err(AppError::LockedOut { seconds_left }) => FlowEvent::Exit(vec![
                        Message::input_control("password:off"),
                        Message::text(format!(
                            "Too many failed attempts. Try again in {seconds_left}s."
                        )),
                    ]),
                    Err(_) => FlowEvent::Exit(vec![
                        Message::input_control("password:off"),
                        Message::text("Invalid username or password."),
                    ]),
                }
            }
        }
    }

    // ── registration ────────────────────────────────────────────────────

    pub fn begin_registration(&self, id: &SessionId) -> Vec<Message> {
        self.registrations.insert(id.clone(), RegistrationFlow::default());
        vec![
            Message::input_control("password:off"),
            Message::prompt("Choose a username: "),
        ]
    }

    pub async fn handle_registration(&self, id: &SessionId, input: &str, ip: &str) -> FlowEvent {
        if is_exit_key(input) {
            self.registrations.remove(id);
            return FlowEvent::Exit(vec![Message::text("Registration cancelled.")]);
        }
        let (username, password) = match self.registrations.get(id) {
            Some(flow) => (flow.username.clone(), flow.password.clone()),
            None => return FlowEvent::Exit(vec![]),
        };
        match (username, password) {
            (None, _) => {
                let name = input.trim().to_string();
                if !AuthService::valid_username(&name) {
                    return FlowEvent::Continue(vec![
                        Message::text("3-16 characters, letters, digits and _, starting with a letter."),
                        Message::prompt("Choose a username: "),
                    ]);
                }
                if let Some(mut flow) = self.registrations.get_mut(id) {
                    flow.username = Some(name);
                }
                FlowEvent::Continue(vec![
                    Message::input_control("password:on"),
                    Message::prompt("Choose a password: "),
                ])
            }
            (Some(_), None) => {
                if let Some(mut flow) = self.registrations.get_mut(id) {
                    flow.password = Some(input.trim().to_string());
                }
                FlowEvent::Continue(vec![Message::prompt("Repeat password: ")])
            }
            (Some(name), Some(password)) => {
                if password != input.trim() {
                    if let Some(mut flow) = self.registrations.get_mut(id) {
                        flow.password = None;
                    }
                    return FlowEvent::Continue(vec![
                        Message::text("Passwords do not match."),
                        Message::prompt("Choose a password: "),
                    ]);
                }
                self.registrations.remove(id);
                match self.auth.register(&name, &password, ip).await {
                    Ok(()) => FlowEvent::Registered {
                        username: name.clone(),
                        messages: vec![
                            Message::input_control("password:off"),
                            Message::text(format!(
                                "Account '{name}' created. Use `login` to sign in."
                            )),
                        ],
                    },
                    Err(e) => FlowEvent::Exit(vec![
                        Message::input_control("password:off"),
                        Message::text(format!("Registration failed: {e}")),
                    ]),
                }
            }
        }
    }

    // ── password change ─────────────────────────────────────────────────

    pub fn begin_password_change(&self, id: &SessionId) -> Vec<Message> {
        self.passwords.insert(id.clone(), PasswordFlow::default());
        vec![
            Message::input_control("password:on"),
            Message::prompt("Current password: "),
        ]
    }

    pub async fn handle_password_change(
        &self,
        id: &SessionId,
        username: &str,
        input: &str,
    ) -> FlowEvent {
        if is_exit_key(input) {
            self.passwords.remove(id);
            return FlowEvent::Exit(vec![
                Message::input_control("password:off"),
                Message::text("Password change cancelled."),
            ]);
        }
        let current = match self.passwords.get(id) {
            Some(flow) => flow.current.clone(),
            None => return FlowEvent::Exit(vec![]),
        };
        match current {
            None => {
                if let Some(mut flow) = self.passwords.get_mut(id) {
                    flow.current = Some(input.trim().to_string());
                }
                FlowEvent::Continue(vec![Message::prompt("New password: ")])
            }
            Some(current) => {
                self.passwords.remove(id);
                match self
                    .auth
                    .change_password(username, &current, input.trim())
                    .await
                {
                    Ok(()) => FlowEvent::PasswordChanged {
                        messages: vec![
                            Message::input_control("password:off"),
                            Message::text("Password changed."),
                        ],
                    },
                    Err(e) => FlowEvent::Exit(vec![
                        Message::input_control("password:off"),
                        Message::text(format!("Password change failed: {e}")),
                    ]),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::memory::MemoryStore;

    fn flows() -> AuthFlows {
        let auth = Arc::new(AuthService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(Config::default()),
        ));
        AuthFlows::new(auth)
    }

    #[tokio::test]
    async fn registration_then_login_flow() {
        let f = flows();
        let id = SessionId::new();
        f.begin_registration(&id);
        assert!(matches!(f.handle_registration(&id, "ada", "ip").await, FlowEvent::Continue(_)));
        assert!(matches!(f.handle_registration(&id, "secret", "ip").await, FlowEvent::Continue(_)));
        let done = f.handle_registration(&id, "secret", "ip").await;
        assert!(matches!(done, FlowEvent::Registered { ref username, .. } if username == "ada"));
        assert!(!f.has_any(&id));

        f.begin_login(&id);
        assert!(matches!(f.handle_login(&id, "ada", "ip").await, FlowEvent::Continue(_)));
        let done = f.handle_login(&id, "secret", "ip").await;
        assert!(matches!(done, FlowEvent::LoggedIn { ref username, .. } if username == "ada"));
    }

    #[tokio::test]
    async fn wrong_password_is_opaque() {
        let f = flows();
        let id = SessionId::new();
        f.begin_login(&id);
        let _ = f.handle_login(&id, "nobody", "ip").await;
        let done = f.handle_login(&id, "whatever", "ip").await;
        let FlowEvent::Exit(msgs) = done else { panic!("expected exit") };
        assert!(msgs.iter().any(|m| m.content.contains("Invalid username or password")));
    }

    #[tokio::test]
    async fn mismatched_passwords_restart_password_step() {
        let f = flows();
        let id = SessionId::new();
        f.begin_registration(&id);
        let _ = f.handle_registration(&id, "ada", "ip").await;
        let _ = f.handle_registration(&id, "one", "ip").await;
        let again = f.handle_registration(&id, "two", "ip").await;
        assert!(matches!(again, FlowEvent::Continue(_)));
        // Flow is still alive and back at the password step
        assert!(f.has_any(&id));
    }

    #[tokio::test]
    async fn escape_cancels_any_flow() {
        let f = flows();
        let id = SessionId::new();
        f.begin_login(&id);
        assert!(matches!(f.handle_login(&id, "\x1b", "ip").await, FlowEvent::Exit(_)));
        assert!(!f.has_any(&id));
    }
}
