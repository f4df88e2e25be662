use crate::commands::CmdCtx;
use crate::models::message::Message;
use crate::state::session::InputMode;

pub fn register(ctx: &CmdCtx<'_>) -> Vec<Message> {
    if ctx.username() != "guest" {
        return vec![Message::text("Log out first to register a new account.")];
    }
    let mut msgs = ctx.registry.auth_flows.begin_registration(ctx.session_id);
    ctx.registry
        .set_input_mode(ctx.session_id, InputMode::RegistrationProcess);
    msgs.insert(0, Message::text("Registering a new account. ESC cancels."));
    msgs
}

/// `login` starts the interactive flow; `login <name> <password>` is the
/// one-line variant.
pub async fn login(ctx: &CmdCtx<'_>, args: Vec<&str>) -> Vec<Message> {
    if ctx.username() != "guest" {
        return vec![Message::text("Already logged in. Use 'logout' first.")];
    }
    if args.len() >= 2 {
        let (name, pass) = (args[0], args[1]);
        let ip = ctx
            .registry
            .session(ctx.session_id)
            .map(|s| s.read().ip_address.clone())
            .unwrap_or_default();
        return match ctx.registry.services.auth.login(name, pass, &ip).await {
            Ok(()) => match ctx.registry.complete_login(ctx.session_id, name).await {
                Ok(mut msgs) => {
                    msgs.push(Message::text(format!("Welcome back, {name}.")));
                    msgs
                }
                Err(e) => vec![Message::text(format!("Login failed: {e}"))],
            },
            Err(e) => vec![Message::text(e.to_string())],
        };
    }
    let msgs = ctx.registry.auth_flows.begin_login(ctx.session_id);
    ctx.registry
        .set_input_mode(ctx.session_id, InputMode::LoginProcess);
    msgs
}

pub async fn logout(ctx: &CmdCtx<'_>) -> Vec<Message> {
    if ctx.username() == "guest" {
        return vec![Message::text("You are not logged in.")];
    }
    match ctx.registry.logout(ctx.session_id).await {
        Ok(msgs) => msgs,
        Err(e) => vec![Message::text(format!("Logout failed: {e}"))],
    }
}

pub fn passwd(ctx: &CmdCtx<'_>) -> Vec<Message> {
    if ctx.username() == "guest" {
        return vec![Message::text("Log in first.")];
    }
    let msgs = ctx.registry.auth_flows.begin_password_change(ctx.session_id);
    ctx.registry
        .set_input_mode(ctx.session_id, InputMode::PasswordChange);
    msgs
}
