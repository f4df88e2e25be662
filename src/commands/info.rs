use crate::commands::{CmdCtx, help_text};
use crate::models::message::Message;

pub fn help(_ctx: &CmdCtx<'_>) -> Vec<Message> {
    // Pre-formatted columns; wrapping would collapse the indentation
    help_text().lines().map(Message::text).collect()
}

pub fn about(ctx: &CmdCtx<'_>) -> Vec<Message> {
    vec![ctx.wrapped(
        "retroterm: a multi-user retro terminal. Shell, line editor, pager, chess, \
         a message board, outbound telnet, and a line-numbered BASIC with a bytecode VM.",
    )]
}

pub fn date(_ctx: &CmdCtx<'_>) -> Vec<Message> {
    vec![Message::text(
        chrono::Utc::now().format("%a %b %e %H:%M:%S UTC %Y").to_string(),
    )]
}

pub fn clear() -> Vec<Message> {
    vec![Message::input_control("clear")]
}

/// Everything after the verb, verbatim.
pub fn echo(raw: &str) -> Vec<Message> {
    let rest = raw
        .split_once(char::is_whitespace)
        .map(|(_, r)| r.trim())
        .unwrap_or("");
    vec![Message::text(rest.to_string())]
}

pub fn whoami(ctx: &CmdCtx<'_>) -> Vec<Message> {
    let name = ctx.username();
    if name == "guest" {
        vec![Message::text("guest (use 'login' or 'register')")]
    } else {
        vec![Message::text(name)]
    }
}

pub fn limits(ctx: &CmdCtx<'_>) -> Vec<Message> {
    let l = ctx.registry.services.quota.limits();
    vec![
        Message::text(format!("BASIC sessions:        {}", l.max_basic_sessions)),
        Message::text(format!("BASIC sessions (guest): {}", l.max_guest_basic_sessions)),
        Message::text(format!("Telnet sessions:       {}", l.max_telnet_sessions)),
        Message::text(format!("Session expiry:        {}h idle", l.session_expiry_hours)),
    ]
}

pub fn resources(ctx: &CmdCtx<'_>) -> Vec<Message> {
    let quota = &ctx.registry.services.quota;
    vec![
        Message::text(format!("Sessions:        {}", ctx.registry.session_count())),
        Message::text(format!("BASIC in use:    {}", quota.basic_in_use())),
        Message::text(format!("Telnet in use:   {}", quota.telnet_in_use())),
    ]
}
