use crate::auth_flow::AuthFlows;
use crate::basic::BasicManager;
use crate::board::BoardManager;
use crate::chess::{ChessEngine, ChessManager};
use crate::config::Config;
use crate::editor::EditorManager;
use crate::error::{AppError, AppResult};
use crate::models::message::Message;
use crate::models::types::{SessionId, TerminalDims};
use crate::net::sink::ClientSink;
use crate::net::telnet::TelnetProxy;
use crate::pager::PagerManager;
use crate::services::auth::AuthService;
use crate::services::chat::{ChatBackend, ChatService};
use crate::services::quota::QuotaService;
use crate::services::vfs::VfsService;
use crate::state::session::{GUEST_USERNAME, InputMode, Session};
use crate::store::{FileStore, UserStore};
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Deadline for session-lock acquisitions initiated by background tasks.
pub const SESSION_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct Services {
    pub auth: Arc<AuthService>,
    pub chat: Arc<ChatService>,
    pub vfs: Arc<VfsService>,
    pub quota: Arc<QuotaService>,
}

/// Owns the session table and every subsystem manager. The session map
/// lock is the only lock that may be held while entering a subsystem map;
/// subsystem code never reaches back into a held session lock.
pub struct Registry {
    pub config: Arc<Config>,
    pub users: Arc<dyn UserStore>,
    pub files: Arc<dyn FileStore>,
    pub services: Arc<Services>,
    pub sink: Arc<dyn ClientSink>,
    sessions: RwLock<HashMap<SessionId, Arc<RwLock<Session>>>>,

    pub telnet: Arc<TelnetProxy>,
    pub pagers: Arc<PagerManager>,
    pub editors: Arc<EditorManager>,
    pub chess: Arc<ChessManager>,
    pub boards: Arc<BoardManager>,
    pub basic: Arc<BasicManager>,
    pub auth_flows: Arc<AuthFlows>,
}

impl Registry {
    pub fn new(
        config: Arc<Config>,
        users: Arc<dyn UserStore>,
        files: Arc<dyn FileStore>,
        sink: Arc<dyn ClientSink>,
        chat_backend: Arc<dyn ChatBackend>,
        chess_engine: Arc<dyn ChessEngine>,
    ) -> Self {
        let auth = Arc::new(AuthService::new(users.clone(), config.clone()));
        let quota = Arc::new(QuotaService::new(config.limits.clone()));
        let vfs = Arc::new(VfsService::new(files.clone()));
        let chat = Arc::new(ChatService::new(chat_backend, users.clone(), config.clone()));

        let services = Arc::new(Services {
            auth: auth.clone(),
            chat,
            vfs: vfs.clone(),
            quota: quota.clone(),
        });

        Self {
            telnet: Arc::new(TelnetProxy::new(sink.clone(), quota.clone())),
            pagers: Arc::new(PagerManager::new()),
            editors: Arc::new(EditorManager::new(vfs)),
            chess: Arc::new(ChessManager::new(chess_engine)),
            boards: Arc::new(BoardManager::new(files.clone())),
            basic: Arc::new(BasicManager::new(sink.clone(), quota, files.clone())),
            auth_flows: Arc::new(AuthFlows::new(auth)),
            config,
            users,
            files,
            services,
            sink,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    // ── session table ───────────────────────────────────────────────────

    pub fn create_guest(&self, ip: &str) -> SessionId {
        let session = Session::new_guest(ip);
        let id = session.id.clone();
        self.sessions
            .write()
            .insert(id.clone(), Arc::new(RwLock::new(session)));
        tracing::debug!(session_id = %id, %ip, "guest session created");
        id
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<RwLock<Session>>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn validate_session(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn get_input_mode(&self, id: &SessionId) -> Option<InputMode> {
        self.session(id).map(|s| s.read().input_mode)
    }

    pub fn set_input_mode(&self, id: &SessionId, mode: InputMode) -> bool {
        match self.session(id) {
            Some(s) => {
                s.write().input_mode = mode;
                true
            }
            None => false,
        }
    }

    /// Deadline-bounded mode change for paths that must not deadlock a
    /// transport worker.
    pub fn try_set_input_mode(&self, id: &SessionId, mode: InputMode) -> AppResult<()> {
        let session = self.session(id).ok_or(AppError::NoSession)?;
        match session.try_write_for(SESSION_LOCK_TIMEOUT) {
            Some(mut guard) => {
                guard.input_mode = mode;
                Ok(())
            }
            None => Err(AppError::Unavailable("session is busy, try again")),
        }
    }

    /// Force a session back to the shell, used when subsystem state and
    /// mode disagree.
    pub fn heal_mode(&self, id: &SessionId) {
        if let Some(session) = self.session(id) {
            let mut guard = session.write();
            if guard.input_mode != InputMode::OsShell {
                tracing::warn!(session_id = %id, mode = ?guard.input_mode, "healing input mode back to shell");
                guard.input_mode = InputMode::OsShell;
            }
        }
    }

    pub fn dims_of(&self, id: &SessionId) -> Option<TerminalDims> {
        self.session(id).map(|s| s.read().dims)
    }

    pub fn set_dims(&self, id: &SessionId, dims: TerminalDims) {
        if let Some(s) = self.session(id) {
            s.write().dims = dims;
        }
    }

    pub fn touch(&self, id: &SessionId) {
        if let Some(s) = self.session(id) {
            s.write().touch();
        }
    }

    pub fn username_of(&self, id: &SessionId) -> Option<String> {
        self.session(id).map(|s| s.read().username.clone())
    }

    // ── identity transitions ────────────────────────────────────────────

    /// Apply a successful login: identity, home path, persisted session
    /// row (unless the user is temporary) and the refreshed token message.
    pub async fn complete_login(&self, id: &SessionId, username: &str) -> AppResult<Vec<Message>> {
        let ip = {
            let session = self.session(id).ok_or(AppError::NoSession)?;
            let mut guard = session.write();
            guard.username = username.to_string();
            guard.current_path = guard.home_path();
            guard.touch();
            guard.ip_address.clone()
        };
        self.services.vfs.ensure_home(username).await?;
        let token = self
            .services
            .auth
            .issue_token(id, username, &ip, &format!("/home/{username}"))
            .await?;
        let temporary = self.config.is_temporary_user(username);
        if temporary {
            tracing::info!(session_id = %id, %username, "temporary user logged in, session not persisted");
        }
        Ok(vec![
            Message::auth_refresh(token).with_params(serde_json::json!({ "temporary": temporary })),
            Message::session("login"),
        ])
    }

    pub async fn logout(&self, id: &SessionId) -> AppResult<Vec<Message>> {
        let Some(session) = self.session(id) else {
            return Err(AppError::NoSession);
        };
        let old = {
            let mut guard = session.write();
            let old = guard.username.clone();
            guard.username = GUEST_USERNAME.to_string();
            guard.current_path = guard.home_path();
            guard.chat_history.clear();
            old
        };
        self.users.delete_session(id.as_str()).await?;
        tracing::info!(session_id = %id, username = %old, "logged out");
        Ok(vec![
            Message::session("logout"),
            Message::text(format!("Goodbye, {old}.")),
        ])
    }

    /// Turn a stored token back into a live session. Expired or unknown
    /// tokens produce a fresh guest session instead.
    pub async fn restore_from_token(&self, token: &str, ip: &str) -> (SessionId, Vec<Message>) {
        match self.services.auth.restore(token).await {
            Ok(Some(restored)) => {
                let session = Session {
                    id: restored.session_id.clone(),
                    username: restored.username.clone(),
                    ip_address: ip.to_string(),
                    current_path: restored.current_path.clone(),
                    created_at: Utc::now(),
                    last_activity: Utc::now(),
                    dims: TerminalDims::default(),
                    input_mode: InputMode::OsShell,
                    chat_history: Vec::new(),
                };
                let id = session.id.clone();
                self.sessions
                    .write()
                    .insert(id.clone(), Arc::new(RwLock::new(session)));
                tracing::info!(session_id = %id, username = %restored.username, "session restored from token");
                (
                    id,
                    vec![Message::text(format!("Welcome back, {}.", restored.username))],
                )
            }
            Ok(None) => {
                let id = self.create_guest(ip);
                (
                    id,
                    vec![Message::text("Session expired; continuing as guest.")],
                )
            }
            Err(e) => {
                tracing::warn!(error = %e, "token restore failed");
                let id = self.create_guest(ip);
                (id, vec![Message::text("Continuing as guest.")])
            }
        }
    }

    // ── teardown ────────────────────────────────────────────────────────

    /// Transport-disconnect hook. The mode reset happens first and
    /// atomically, so a concurrent reconnect sees a clean shell; the
    /// subsystem releases that follow are independent of each other.
    pub async fn cleanup_session_resources(&self, id: &SessionId) {
        let _ = self.try_set_input_mode(id, InputMode::OsShell);

        self.telnet.cleanup(id).await;
        self.editors.remove(id);
        self.pagers.remove(id);
        self.chess.remove(id);
        self.boards.remove(id);
        self.basic.remove(id);
        self.auth_flows.clear(id);
        tracing::debug!(session_id = %id, "session resources released");
    }

    /// Full destruction: resources, table entry, persisted row.
    pub async fn destroy_session(&self, id: &SessionId) {
        self.cleanup_session_resources(id).await;
        self.sessions.write().remove(id);
        if let Err(e) = self.users.delete_session(id.as_str()).await {
            tracing::warn!(session_id = %id, error = %e, "failed to delete session row");
        }
    }

    /// Expire idle sessions and reconcile subsystem state against the
    /// session table.
    pub async fn sweep(&self) {
        let max_idle = ChronoDuration::hours(self.config.limits.session_expiry_hours);
        let now = Utc::now();
        let expired: Vec<SessionId> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, s)| now - s.read().last_activity > max_idle)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            tracing::info!(session_id = %id, "expiring idle session");
            self.destroy_session(&id).await;
        }

        // Telnet states whose session left telnet mode
        self.telnet.reconcile(self).await;

        // Ghost modes: a session claims a subsystem that has no state
        let ids: Vec<SessionId> = self.sessions.read().keys().cloned().collect();
        for id in ids {
            let Some(mode) = self.get_input_mode(&id) else { continue };
            let consistent = match mode {
                InputMode::OsShell => true,
                InputMode::Telnet => self.telnet.has(&id),
                InputMode::Pager => self.pagers.is_active(&id),
                InputMode::Editor => self.editors.is_active(&id),
                InputMode::Chess => self.chess.is_active(&id),
                InputMode::Board => self.boards.is_active(&id),
                InputMode::BasicInterpreter => self.basic.is_active(&id),
                InputMode::LoginProcess
                | InputMode::RegistrationProcess
                | InputMode::PasswordChange => self.auth_flows.has_any(&id),
            };
            if !consistent {
                self.heal_mode(&id);
            }
        }
    }

    pub fn spawn_sweeper(self: Arc<Self>) {
        let registry = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.sweep().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::ScriptedEngine;
    use crate::net::sink::BufferSink;
    use crate::services::chat::OfflineChatBackend;
    use crate::store::memory::MemoryStore;

    pub fn test_registry() -> Arc<Registry> {
        let store = Arc::new(MemoryStore::new());
        Arc::new(Registry::new(
            Arc::new(Config::default()),
            store.clone(),
            store,
            Arc::new(BufferSink::new()),
            Arc::new(OfflineChatBackend),
            Arc::new(ScriptedEngine),
        ))
    }

    #[tokio::test]
    async fn guest_lifecycle_and_mode_atomicity() {
        let registry = test_registry();
        let id = registry.create_guest("127.0.0.1");
        assert!(registry.validate_session(&id));
        assert_eq!(registry.get_input_mode(&id), Some(InputMode::OsShell));

        registry.set_input_mode(&id, InputMode::Editor);
        assert_eq!(registry.get_input_mode(&id), Some(InputMode::Editor));

        registry.cleanup_session_resources(&id).await;
        assert_eq!(registry.get_input_mode(&id), Some(InputMode::OsShell));
    }

    #[tokio::test]
    async fn cleanup_clears_every_subsystem_map() {
        let registry = test_registry();
        let id = registry.create_guest("127.0.0.1");
        registry.editors.open(&id, "guest", "/home/guest/a").await;
        registry.pagers.open(&id, "a", "x\ny", TerminalDims { cols: 80, rows: 3 });
        registry.chess.open(&id);
        registry.boards.open(&id).await;
        registry.basic.enter(&id, "guest", true).unwrap();
        registry.auth_flows.begin_login(&id);

        registry.cleanup_session_resources(&id).await;

        assert!(!registry.editors.is_active(&id));
        assert!(!registry.pagers.is_active(&id));
        assert!(!registry.chess.is_active(&id));
        assert!(!registry.boards.is_active(&id));
        assert!(!registry.basic.is_active(&id));
        assert!(!registry.auth_flows.has_any(&id));
        assert!(!registry.telnet.has(&id));
        assert_eq!(registry.get_input_mode(&id), Some(InputMode::OsShell));
    }

    #[tokio::test]
    async fn ghost_mode_is_healed_by_sweep() {
        let registry = test_registry();
        let id = registry.create_guest("127.0.0.1");
        // Mode says telnet but no telnet state exists
        registry.set_input_mode(&id, InputMode::Telnet);
        registry.sweep().await;
        assert_eq!(registry.get_input_mode(&id), Some(InputMode::OsShell));
    }

    #[tokio::test]
    async fn expired_sessions_are_destroyed() {
        let registry = test_registry();
        let id = registry.create_guest("127.0.0.1");
        {
            let session = registry.session(&id).unwrap();
            session.write().last_activity = Utc::now() - ChronoDuration::hours(30);
        }
        registry.sweep().await;
        assert!(!registry.validate_session(&id));
    }

    #[tokio::test]
    async fn login_then_logout_round_trip() {
        let registry = test_registry();
        registry
            .services
            .auth
            .register("ada", "secret", "ip")
            .await
            .unwrap();
        let id = registry.create_guest("ip");
        let msgs = registry.complete_login(&id, "ada").await.unwrap();
        assert!(msgs.iter().any(|m| m.kind == crate::models::message::MessageKind::AuthRefresh));
        assert_eq!(registry.username_of(&id).as_deref(), Some("ada"));

        registry.logout(&id).await.unwrap();
        assert_eq!(registry.username_of(&id).as_deref(), Some(GUEST_USERNAME));
    }
}
