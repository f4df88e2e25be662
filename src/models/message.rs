use crate::models::types::SessionId;
use crate::util::wrap::wrap_text;
use serde::{Deserialize, Serialize};

/// Message kinds understood by the client transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Sound,
    Session,
    InputControl,
    Prompt,
    Editor,
    Pager,
    Telnet,
    Mode,
    AuthRefresh,
    Physics,
    Graphics,
}

/// One outbound frame for the transport. The core hands these back in
/// ordered batches; the telnet reader additionally pushes them through
/// [`crate::net::sink::ClientSink`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Message {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            session_id: None,
            params: None,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Text, content)
    }

    /// Text wrapped to the session's terminal width.
    pub fn wrapped(content: impl Into<String>, cols: u16) -> Self {
        Self::new(MessageKind::Text, wrap_text(&content.into(), cols as usize))
    }

    pub fn prompt(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Prompt, content)
    }

    pub fn sound(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Sound, content)
    }

    pub fn telnet(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Telnet, content)
    }

    pub fn pager(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Pager, content)
    }

    pub fn editor(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Editor, content)
    }

    pub fn mode(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Mode, content)
    }

    pub fn input_control(content: impl Into<String>) -> Self {
        Self::new(MessageKind::InputControl, content)
    }

    pub fn session(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Session, content)
    }

    pub fn auth_refresh(content: impl Into<String>) -> Self {
        Self::new(MessageKind::AuthRefresh, content)
    }

    pub fn physics(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Physics, content)
    }

    pub fn graphics(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Graphics, content)
    }

    pub fn with_session(mut self, id: &SessionId) -> Self {
        self.session_id = Some(id.clone());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }
}
