use crate::commands::CmdCtx;
use crate::models::message::Message;
use crate::pager::PagerManager;
use crate::services::vfs::VfsService;
use crate::state::session::InputMode;
use crate::util::args::split_args_quoted;

fn current_path(ctx: &CmdCtx<'_>) -> String {
    ctx.registry
        .session(ctx.session_id)
        .map(|s| s.read().current_path.clone())
        .unwrap_or_else(|| "/".to_string())
}

pub fn pwd(ctx: &CmdCtx<'_>) -> Vec<Message> {
    vec![Message::text(current_path(ctx))]
}

pub async fn ls(ctx: &CmdCtx<'_>, args: Vec<&str>) -> Vec<Message> {
    let username = ctx.username();
    let path = VfsService::normalize(&current_path(ctx), args.first().unwrap_or(&""));
    // Home directories appear lazily
    let _ = ctx.registry.services.vfs.ensure_home(&username).await;
    match ctx.registry.services.vfs.list(&username, &path).await {
        Ok(entries) if entries.is_empty() => vec![Message::text("(empty)")],
        Ok(entries) => entries
            .iter()
            .map(|f| {
                let name = f.path.rsplit('/').next().unwrap_or(&f.path);
                if f.is_dir {
                    Message::text(format!("{name}/"))
                } else {
                    Message::text(format!("{name}  {} bytes", f.content.len()))
                }
            })
            .collect(),
        Err(e) => vec![ctx.wrapped(format!("ls: {path}: {e}"))],
    }
}

pub async fn cd(ctx: &CmdCtx<'_>, args: Vec<&str>) -> Vec<Message> {
    let username = ctx.username();
    let target = match args.first() {
        Some(a) => VfsService::normalize(&current_path(ctx), a),
        None => format!("/home/{username}"),
    };
    let _ = ctx.registry.services.vfs.ensure_home(&username).await;
    match ctx.registry.services.vfs.is_dir(&username, &target).await {
        Ok(true) => {
            if let Some(session) = ctx.registry.session(ctx.session_id) {
                session.write().current_path = target;
            }
            Vec::new()
        }
        Ok(false) => vec![Message::text(format!("cd: {target}: no such directory"))],
        Err(e) => vec![Message::text(format!("cd: {e}"))],
    }
}

pub async fn mkdir(ctx: &CmdCtx<'_>, args: Vec<&str>) -> Vec<Message> {
    let Some(arg) = args.first() else {
        return vec![Message::text("Usage: mkdir <dir>")];
    };
    let username = ctx.username();
    let path = VfsService::normalize(&current_path(ctx), arg);
    let _ = ctx.registry.services.vfs.ensure_home(&username).await;
    match ctx.registry.services.vfs.mkdir(&username, &path).await {
        Ok(()) => Vec::new(),
        Err(e) => vec![Message::text(format!("mkdir: {e}"))],
    }
}

/// `cat` shows short files inline and switches to the pager for anything
/// taller than one screen.
pub async fn cat(ctx: &CmdCtx<'_>, args: Vec<&str>) -> Vec<Message> {
    let Some(arg) = args.first() else {
        return vec![Message::text("Usage: cat <file>")];
    };
    let username = ctx.username();
    let path = VfsService::normalize(&current_path(ctx), arg);
    let file = match ctx.registry.services.vfs.read_file(&username, &path).await {
        Ok(f) => f,
        Err(e) => return vec![Message::text(format!("cat: {path}: {e}"))],
    };
    let dims = ctx.registry.dims_of(ctx.session_id).unwrap_or_default();
    if PagerManager::needs_paging(&file.content, dims) {
        let msgs = ctx.registry.pagers.open(ctx.session_id, &path, &file.content, dims);
        ctx.registry.set_input_mode(ctx.session_id, InputMode::Pager);
        return msgs;
    }
    file.content.lines().map(Message::text).collect()
}

/// `write <file> "content"` — quoted content may contain spaces.
pub async fn write(ctx: &CmdCtx<'_>, raw: &str) -> Vec<Message> {
    let parts = split_args_quoted(raw);
    if parts.len() < 3 {
        return vec![Message::text(r#"Usage: write <file> "content""#)];
    }
    let username = ctx.username();
    let path = VfsService::normalize(&current_path(ctx), &parts[1]);
    let content = parts[2..].join(" ");
    let _ = ctx.registry.services.vfs.ensure_home(&username).await;
    match ctx
        .registry
        .services
        .vfs
        .write_file(&username, &path, &content)
        .await
    {
        Ok(()) => vec![Message::text(format!("Wrote {} bytes to {path}", content.len()))],
        Err(e) => vec![Message::text(format!("write: {e}"))],
    }
}

pub async fn rm(ctx: &CmdCtx<'_>, args: Vec<&str>) -> Vec<Message> {
    let Some(arg) = args.first() else {
        return vec![Message::text("Usage: rm <path>")];
    };
    let username = ctx.username();
    let path = VfsService::normalize(&current_path(ctx), arg);
    match ctx.registry.services.vfs.remove(&username, &path).await {
        Ok(()) => Vec::new(),
        Err(e) => vec![Message::text(format!("rm: {path}: {e}"))],
    }
}
