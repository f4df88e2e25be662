use crate::models::message::Message;
use crate::models::types::SessionId;
use crate::state::registry::Registry;
use std::sync::Arc;

mod auth_cmd;
mod chat_cmd;
mod files;
mod info;
mod subsys;

/// Everything a command handler needs. Session identity travels as an id;
/// handlers look the session up on demand.
pub struct CmdCtx<'a> {
    pub registry: &'a Arc<Registry>,
    pub session_id: &'a SessionId,
}

impl CmdCtx<'_> {
    pub fn username(&self) -> String {
        self.registry
            .username_of(self.session_id)
            .unwrap_or_else(|| "guest".to_string())
    }

    pub fn cols(&self) -> u16 {
        self.registry
            .dims_of(self.session_id)
            .map(|d| d.cols)
            .unwrap_or(80)
    }

    pub fn wrapped(&self, text: impl Into<String>) -> Message {
        Message::wrapped(text, self.cols())
    }
}

/// Shell dispatch: split on whitespace, map the first token
/// case-insensitively against the command table, hand the session id and
/// the remaining tokens to the handler.
pub async fn process_command(
    raw: &str,
    registry: &Arc<Registry>,
    session_id: &SessionId,
) -> Vec<Message> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let mut it = trimmed.split_whitespace();
    let Some(verb) = it.next() else {
        return Vec::new();
    };
    // Frontends send this to interrupt; it is deliberately silent
    if verb == "__BREAK__" {
        return Vec::new();
    }

    let args: Vec<&str> = it.collect();
    let ctx = CmdCtx { registry, session_id };

    match verb.to_ascii_lowercase().as_str() {
        "help" => info::help(&ctx),
        "about" => info::about(&ctx),
        "date" => info::date(&ctx),
        "clear" => info::clear(),
        "echo" => info::echo(trimmed),
        "whoami" => info::whoami(&ctx),
        "limits" => info::limits(&ctx),
        "resources" => info::resources(&ctx),

        "register" => auth_cmd::register(&ctx),
        "login" => auth_cmd::login(&ctx, args).await,
        "logout" => auth_cmd::logout(&ctx).await,
        "passwd" => auth_cmd::passwd(&ctx),

        "ls" => files::ls(&ctx, args).await,
        "pwd" => files::pwd(&ctx),
        "cd" => files::cd(&ctx, args).await,
        "mkdir" => files::mkdir(&ctx, args).await,
        "cat" => files::cat(&ctx, args).await,
        "write" => files::write(&ctx, trimmed).await,
        "rm" => files::rm(&ctx, args).await,

        "chat" => chat_cmd::chat(&ctx, &args).await,
        "chathistory" => chat_cmd::chathistory(&ctx),

        "edit" => subsys::edit(&ctx, args).await,
        "view" => subsys::view(&ctx, args).await,
        "basic" => subsys::basic(&ctx),
        "run" => subsys::run(&ctx, args).await,
        "chess" => subsys::chess(&ctx),
        "telnet" => subsys::telnet(&ctx, args).await,
        "board" => subsys::board(&ctx).await,

        other => vec![ctx.wrapped(format!("Unknown command '{other}'. Type 'help' for a list."))],
    }
}

pub fn help_text() -> &'static str {
    r#"Available commands
------------------
  help                    This list
  about                   What this system is
  date                    Current server time
  clear                   Clear the screen
  echo <text>             Print text
  whoami                  Who you are logged in as
  register                Create an account (interactive)
  login [name pass]       Log in (interactive without arguments)
  logout                  Back to guest
  passwd                  Change your password
  ls / pwd / cd <dir>     Browse your files
  mkdir <dir>             Create a directory
  cat <file>              Show a file (pages when long)
  write <file> "text"     Write text into a file
  rm <path>               Remove a file or empty directory
  edit <file>             Open the line editor
  view <file>             Page through a file
  basic                   Enter the BASIC interpreter
  run <file>              Run a BASIC program from a file
  chess                   Play chess
  board                   The message board
  telnet <server>         Connect to a configured remote
  chat <text>             Talk to the assistant
  chathistory             Show this session's chat
  limits / resources      Caps and current usage
"#
}
