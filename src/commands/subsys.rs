use crate::commands::CmdCtx;
use crate::models::message::Message;
use crate::services::vfs::VfsService;
use crate::state::session::InputMode;

fn current_path(ctx: &CmdCtx<'_>) -> String {
    ctx.registry
        .session(ctx.session_id)
        .map(|s| s.read().current_path.clone())
        .unwrap_or_else(|| "/".to_string())
}

pub async fn edit(ctx: &CmdCtx<'_>, args: Vec<&str>) -> Vec<Message> {
    let Some(arg) = args.first() else {
        return vec![Message::text("Usage: edit <file>")];
    };
    let username = ctx.username();
    let path = VfsService::normalize(&current_path(ctx), arg);
    let _ = ctx.registry.services.vfs.ensure_home(&username).await;
    let msgs = ctx.registry.editors.open(ctx.session_id, &username, &path).await;
    ctx.registry.set_input_mode(ctx.session_id, InputMode::Editor);
    msgs
}

/// Always page, regardless of length.
pub async fn view(ctx: &CmdCtx<'_>, args: Vec<&str>) -> Vec<Message> {
    let Some(arg) = args.first() else {
        return vec![Message::text("Usage: view <file>")];
    };
    let username = ctx.username();
    let path = VfsService::normalize(&current_path(ctx), arg);
    let file = match ctx.registry.services.vfs.read_file(&username, &path).await {
        Ok(f) => f,
        Err(e) => return vec![Message::text(format!("view: {path}: {e}"))],
    };
    let dims = ctx.registry.dims_of(ctx.session_id).unwrap_or_default();
    let msgs = ctx.registry.pagers.open(ctx.session_id, &path, &file.content, dims);
    ctx.registry.set_input_mode(ctx.session_id, InputMode::Pager);
    msgs
}

pub fn basic(ctx: &CmdCtx<'_>) -> Vec<Message> {
    let username = ctx.username();
    let is_guest = username == "guest";
    match ctx.registry.basic.enter(ctx.session_id, &username, is_guest) {
        Ok(msgs) => {
            ctx.registry
                .set_input_mode(ctx.session_id, InputMode::BasicInterpreter);
            msgs
        }
        Err(e) => vec![ctx.wrapped(e.to_string())],
    }
}

/// `run <file>`: load a BASIC program from the VFS and start it.
pub async fn run(ctx: &CmdCtx<'_>, args: Vec<&str>) -> Vec<Message> {
    let Some(arg) = args.first() else {
        return vec![Message::text("Usage: run <file>")];
    };
    let username = ctx.username();
    let is_guest = username == "guest";
    let path = VfsService::normalize(&current_path(ctx), arg);
    let file = match ctx.registry.services.vfs.read_file(&username, &path).await {
        Ok(f) => f,
        Err(e) => return vec![Message::text(format!("run: {path}: {e}"))],
    };
    match ctx
        .registry
        .basic
        .enter_and_run(ctx.session_id, &username, is_guest, &file.content)
        .await
    {
        Ok(msgs) => {
            ctx.registry
                .set_input_mode(ctx.session_id, InputMode::BasicInterpreter);
            msgs
        }
        Err(e) => vec![ctx.wrapped(e.to_string())],
    }
}

pub fn chess(ctx: &CmdCtx<'_>) -> Vec<Message> {
    let msgs = ctx.registry.chess.open(ctx.session_id);
    ctx.registry.set_input_mode(ctx.session_id, InputMode::Chess);
    msgs
}

pub async fn board(ctx: &CmdCtx<'_>) -> Vec<Message> {
    let msgs = ctx.registry.boards.open(ctx.session_id).await;
    ctx.registry.set_input_mode(ctx.session_id, InputMode::Board);
    msgs
}

pub async fn telnet(ctx: &CmdCtx<'_>, args: Vec<&str>) -> Vec<Message> {
    let Some(key) = args.first() else {
        let known = ctx.registry.config.telnet_server_keys();
        if known.is_empty() {
            return vec![Message::text("No telnet servers are configured.")];
        }
        let mut msgs = vec![Message::text("Usage: telnet <server>. Configured servers:")];
        for key in known {
            if let Some(server) = ctx.registry.config.telnet_server(&key) {
                msgs.push(Message::text(format!(
                    "  {key:12} {} ({})",
                    server.display_name, server.host_port
                )));
            }
        }
        return msgs;
    };
    // open() flips the input mode itself once the dial succeeds
    ctx.registry
        .telnet
        .open(ctx.registry, ctx.session_id, key)
        .await
}
