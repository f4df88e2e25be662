use crate::commands::CmdCtx;
use crate::models::message::Message;
use crate::state::session::ChatRole;

pub async fn chat(ctx: &CmdCtx<'_>, args: &[&str]) -> Vec<Message> {
    if args.is_empty() {
        return vec![Message::text("Usage: chat <message>")];
    }
    let text = args.join(" ");
    let (username, ip, history) = {
        let Some(session) = ctx.registry.session(ctx.session_id) else {
            return vec![Message::text("No session.")];
        };
        let mut guard = session.write();
        guard.push_chat(ChatRole::User, text.clone());
        (
            guard.username.clone(),
            guard.ip_address.clone(),
            guard.chat_history.clone(),
        )
    };

    match ctx
        .registry
        .services
        .chat
        .chat(&username, &ip, &history)
        .await
    {
        Ok(reply) => {
            if let Some(session) = ctx.registry.session(ctx.session_id) {
                session.write().push_chat(ChatRole::Assistant, reply.clone());
            }
            vec![ctx.wrapped(reply)]
        }
        Err(e) => vec![ctx.wrapped(e.to_string())],
    }
}

pub fn chathistory(ctx: &CmdCtx<'_>) -> Vec<Message> {
    let Some(session) = ctx.registry.session(ctx.session_id) else {
        return vec![Message::text("No session.")];
    };
    let history = session.read().chat_history.clone();
    if history.is_empty() {
        return vec![Message::text("No chat in this session yet.")];
    }
    history
        .iter()
        .map(|entry| {
            let who = match entry.role {
                ChatRole::User => "you",
                ChatRole::Assistant => "assistant",
            };
            ctx.wrapped(format!(
                "[{}] {who}: {}",
                entry.time.format("%H:%M:%S"),
                entry.content
            ))
        })
        .collect()
}
