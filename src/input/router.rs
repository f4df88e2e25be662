use crate::auth_flow::FlowEvent;
use crate::commands::process_command;
use crate::models::message::Message;
use crate::models::types::SessionId;
use crate::state::registry::Registry;
use crate::state::session::InputMode;
use std::sync::Arc;

/// Commands an absent session may still run, processed as an unpersisted
/// guest.
const SESSIONLESS_WHITELIST: &[&str] = &["help", "echo", "clear"];

/// The single dispatch point from `(session, input)` to exactly one
/// subsystem, selected by the session's input mode. Returns the ordered
/// outbound batch for the transport.
pub async fn execute_with_context(
    registry: &Arc<Registry>,
    session_id: &SessionId,
    input: &str,
) -> Vec<Message> {
    if !registry.validate_session(session_id) {
        let verb = input
            .trim()
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if SESSIONLESS_WHITELIST.contains(&verb.as_str()) {
            return process_command(input, registry, session_id).await;
        }
        return vec![
            Message::session("invalid"),
            Message::text("Session not found. Reconnect to continue."),
        ];
    }

    registry.touch(session_id);
    let mode = registry
        .get_input_mode(session_id)
        .unwrap_or(InputMode::OsShell);

    match mode {
        InputMode::OsShell => process_command(input, registry, session_id).await,

        InputMode::Editor => {
            let reply = registry.editors.handle_input(session_id, input).await;
            finish_adapter(registry, session_id, reply.exited, reply.messages)
        }
        InputMode::Pager => {
            let reply = registry.pagers.handle_input(session_id, input);
            finish_adapter(registry, session_id, reply.exited, reply.messages)
        }
        InputMode::Chess => {
            let reply = registry.chess.handle_input(session_id, input);
            finish_adapter(registry, session_id, reply.exited, reply.messages)
        }
        InputMode::Board => {
            let username = registry
                .username_of(session_id)
                .unwrap_or_else(|| "guest".into());
            let reply = registry.boards.handle_input(session_id, &username, input).await;
            finish_adapter(registry, session_id, reply.exited, reply.messages)
        }
        InputMode::BasicInterpreter => {
            let reply = registry.basic.handle_input(session_id, input).await;
            finish_adapter(registry, session_id, reply.exited, reply.messages)
        }
        InputMode::Telnet => {
            let reply = registry
                .telnet
                .handle_input(registry, session_id, input)
                .await;
            finish_adapter(registry, session_id, reply.exited, reply.messages)
        }

        InputMode::LoginProcess => {
            let ip = registry
                .session(session_id)
                .map(|s| s.read().ip_address.clone())
                .unwrap_or_default();
            let event = registry
                .auth_flows
                .handle_login(session_id, input, &ip)
                .await;
            apply_flow_event(registry, session_id, event).await
        }
        InputMode::RegistrationProcess => {
            let ip = registry
                .session(session_id)
                .map(|s| s.read().ip_address.clone())
                .unwrap_or_default();
            let event = registry
                .auth_flows
                .handle_registration(session_id, input, &ip)
                .await;
            apply_flow_event(registry, session_id, event).await
        }
        InputMode::PasswordChange => {
            let username = registry
                .username_of(session_id)
                .unwrap_or_else(|| "guest".into());
            let event = registry
                .auth_flows
                .handle_password_change(session_id, &username, input)
                .await;
            apply_flow_event(registry, session_id, event).await
        }
    }
}

/// An adapter that signals exit gets the mode reset here; the triggering
/// input is never forwarded to the shell.
fn finish_adapter(
    registry: &Arc<Registry>,
    session_id: &SessionId,
    exited: bool,
    mut messages: Vec<Message>,
) -> Vec<Message> {
    if exited {
        registry.set_input_mode(session_id, InputMode::OsShell);
        messages.push(shell_prompt(registry, session_id));
    }
    messages
}

async fn apply_flow_event(
    registry: &Arc<Registry>,
    session_id: &SessionId,
    event: FlowEvent,
) -> Vec<Message> {
    match event {
        FlowEvent::Continue(messages) => messages,
        FlowEvent::Exit(messages) => finish_adapter(registry, session_id, true, messages),
        FlowEvent::Registered { messages, .. } => {
            finish_adapter(registry, session_id, true, messages)
        }
        FlowEvent::PasswordChanged { messages } => {
            finish_adapter(registry, session_id, true, messages)
        }
        FlowEvent::LoggedIn { username, messages } => {
            let mut out = messages;
            match registry.complete_login(session_id, &username).await {
                Ok(more) => out.extend(more),
                Err(e) => out.push(Message::text(format!("Login bookkeeping failed: {e}"))),
            }
            finish_adapter(registry, session_id, true, out)
        }
    }
}

/// The shell prompt the frontend paints after a subsystem hands control
/// back.
pub fn shell_prompt(registry: &Arc<Registry>, session_id: &SessionId) -> Message {
    let (username, path) = registry
        .session(session_id)
        .map(|s| {
            let guard = s.read();
            (guard.username.clone(), guard.current_path.clone())
        })
        .unwrap_or_else(|| ("guest".into(), "/".into()));
    Message::prompt(format!("{username}:{path}$ "))
}
