use crate::input::{AdapterReply, is_exit_key};
use crate::models::message::Message;
use crate::models::types::SessionId;
use crate::services::vfs::VfsService;
use dashmap::DashMap;
use std::sync::Arc;

struct EditorState {
    username: String,
    path: String,
    lines: Vec<String>,
    dirty: bool,
}

/// Line editor subsystem. While a session is in editor mode every input
/// line lands here; dot-commands control the buffer, anything else appends.
pub struct EditorManager {
    vfs: Arc<VfsService>,
    editors: DashMap<SessionId, EditorState>,
}

impl EditorManager {
    pub fn new(vfs: Arc<VfsService>) -> Self {
        Self {
            vfs,
            editors: DashMap::new(),
        }
    }

    pub fn is_active(&self, id: &SessionId) -> bool {
        self.editors.contains_key(id)
    }

    pub fn remove(&self, id: &SessionId) {
        self.editors.remove(id);
    }

    pub async fn open(&self, id: &SessionId, username: &str, path: &str) -> Vec<Message> {
        let existing = self.vfs.read_file(username, path).await.ok();
        let lines: Vec<String> = existing
            .map(|f| f.content.lines().map(str::to_string).collect())
            .unwrap_or_default();
        let count = lines.len();
        self.editors.insert(
            id.clone(),
            EditorState {
                username: username.to_string(),
                path: path.to_string(),
                lines,
                dirty: false,
            },
        );
        vec![
            Message::editor("start"),
            Message::text(format!("Editing {path} ({count} lines).")),
            Message::text("Type to append. .list shows, .del N deletes, .save writes, .quit leaves."),
        ]
    }

    pub async fn handle_input(&self, id: &SessionId, input: &str) -> AdapterReply {
        if is_exit_key(input) {
            return self.quit(id, false).await;
        }
        let Some(mut state) = self.editors.get_mut(id) else {
            return AdapterReply::exit(vec![]);
        };
        let trimmed = input.trim_end();
        if !trimmed.starts_with('.') {
            state.lines.push(trimmed.to_string());
            state.dirty = true;
            return AdapterReply::stay(vec![]);
        }

        let mut it = trimmed.split_whitespace();
        let cmd = it.next().unwrap_or_default();
        match cmd {
            ".list" | ".l" => {
                let mut msgs: Vec<Message> = state
                    .lines
                    .iter()
                    .enumerate()
                    .map(|(i, l)| Message::text(format!("{:>4} {l}", i + 1)))
                    .collect();
                if msgs.is_empty() {
                    msgs.push(Message::text("(empty)"));
                }
                AdapterReply::stay(msgs)
            }
            ".del" | ".d" => {
                let Some(n) = it.next().and_then(|s| s.parse::<usize>().ok()) else {
                    return AdapterReply::stay(vec![Message::text("Usage: .del <line>")]);
                };
                if n == 0 || n > state.lines.len() {
                    return AdapterReply::stay(vec![Message::text(format!("No line {n}."))]);
                }
                state.lines.remove(n - 1);
                state.dirty = true;
                AdapterReply::stay(vec![Message::text(format!("Deleted line {n}."))])
            }
            ".save" | ".w" => {
                let (username, path, content) =
                    (state.username.clone(), state.path.clone(), state.lines.join("\n"));
                drop(state);
                match self.vfs.write_file(&username, &path, &content).await {
                    Ok(()) => {
                        if let Some(mut s) = self.editors.get_mut(id) {
                            s.dirty = false;
                        }
                        AdapterReply::stay(vec![Message::text(format!("Wrote {path}."))])
                    }
                    Err(e) => AdapterReply::stay(vec![Message::text(format!("Save failed: {e}"))]),
                }
            }
            ".quit" | ".q" => {
                drop(state);
                self.quit(id, false).await
            }
            ".wq" => {
                let (username, path, content) =
                    (state.username.clone(), state.path.clone(), state.lines.join("\n"));
                drop(state);
                match self.vfs.write_file(&username, &path, &content).await {
                    Ok(()) => {
                        self.editors.remove(id);
                        AdapterReply::exit(vec![
                            Message::editor("end"),
                            Message::text(format!("Wrote {path}.")),
                        ])
                    }
                    Err(e) => AdapterReply::stay(vec![Message::text(format!("Save failed: {e}"))]),
                }
            }
            _ => AdapterReply::stay(vec![Message::text(format!("Unknown editor command {cmd}."))]),
        }
    }

    async fn quit(&self, id: &SessionId, _save: bool) -> AdapterReply {
        let dirty = self
            .editors
            .remove(id)
            .map(|(_, s)| s.dirty)
            .unwrap_or(false);
        let mut msgs = vec![Message::editor("end")];
        if dirty {
            msgs.push(Message::text("Left editor; unsaved changes were discarded."));
        } else {
            msgs.push(Message::text("Left editor."));
        }
        AdapterReply::exit(msgs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn manager() -> EditorManager {
        EditorManager::new(Arc::new(VfsService::new(Arc::new(MemoryStore::new()))))
    }

    #[tokio::test]
    async fn append_save_quit_round_trip() {
        let ed = manager();
        let id = SessionId::new();
        ed.open(&id, "ada", "/home/ada/notes.txt").await;
        ed.handle_input(&id, "hello").await;
        ed.handle_input(&id, "world").await;
        let reply = ed.handle_input(&id, ".save").await;
        assert!(reply.messages.iter().any(|m| m.content.contains("Wrote")));
        let reply = ed.handle_input(&id, ".quit").await;
        assert!(reply.exited);
        assert!(!ed.is_active(&id));

        // Reopening sees the saved content
        let msgs = ed.open(&id, "ada", "/home/ada/notes.txt").await;
        assert!(msgs.iter().any(|m| m.content.contains("2 lines")));
    }

    #[tokio::test]
    async fn exit_key_discards_and_exits() {
        let ed = manager();
        let id = SessionId::new();
        ed.open(&id, "ada", "/home/ada/x").await;
        ed.handle_input(&id, "draft").await;
        let reply = ed.handle_input(&id, "\x18").await;
        assert!(reply.exited);
        assert!(reply.messages.iter().any(|m| m.content.contains("discarded")));
        assert!(reply.messages.iter().any(|m| m.kind == crate::models::message::MessageKind::Editor));
    }

    #[tokio::test]
    async fn delete_line() {
        let ed = manager();
        let id = SessionId::new();
        ed.open(&id, "ada", "/home/ada/x").await;
        ed.handle_input(&id, "one").await;
        ed.handle_input(&id, "two").await;
        ed.handle_input(&id, ".del 1").await;
        let reply = ed.handle_input(&id, ".list").await;
        assert!(reply.messages.iter().any(|m| m.content.contains("two")));
        assert!(!reply.messages.iter().any(|m| m.content.contains("one")));
    }
}
