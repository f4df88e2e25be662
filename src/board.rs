use crate::input::{AdapterReply, is_exit_key};
use crate::models::message::Message;
use crate::models::types::SessionId;
use crate::store::FileStore;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Store namespace the shared board lives under.
const BOARD_USER: &str = "__system__";
const BOARD_PATH: &str = "/board/messages.json";
const MAX_POSTS: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardPost {
    pub author: String,
    pub text: String,
    pub posted_at: DateTime<Utc>,
}

/// The shared message board. Sessions in board mode browse and post; the
/// posts themselves persist through the file store so they survive
/// restarts alongside the virtual files.
pub struct BoardManager {
    files: Arc<dyn FileStore>,
    /// Marker map: which sessions are currently in board mode.
    active: DashMap<SessionId, ()>,
}

impl BoardManager {
    pub fn new(files: Arc<dyn FileStore>) -> Self {
        Self {
            files,
            active: DashMap::new(),
        }
    }

    pub fn is_active(&self, id: &SessionId) -> bool {
        self.active.contains_key(id)
    }

    pub fn remove(&self, id: &SessionId) {
        self.active.remove(id);
    }

    pub async fn open(&self, id: &SessionId) -> Vec<Message> {
        self.active.insert(id.clone(), ());
        let count = self.load_posts().await.len();
        vec![
            Message::mode("board:start"),
            Message::text(format!("Message board: {count} post(s).")),
            Message::text("Commands: list, read <n>, post <text>, quit."),
        ]
    }

    pub async fn handle_input(&self, id: &SessionId, username: &str, input: &str) -> AdapterReply {
        let trimmed = input.trim();
        if is_exit_key(input) || trimmed.eq_ignore_ascii_case("quit") {
            self.active.remove(id);
            return AdapterReply::exit(vec![
                Message::mode("board:end"),
                Message::text("Leaving the board."),
            ]);
        }
        if !self.active.contains_key(id) {
            return AdapterReply::exit(vec![]);
        }

        let (verb, rest) = match trimmed.split_once(' ') {
            Some((v, r)) => (v.to_lowercase(), r.trim()),
            None => (trimmed.to_lowercase(), ""),
        };
        match verb.as_str() {
            "list" | "" => {
                let posts = self.load_posts().await;
                if posts.is_empty() {
                    return AdapterReply::stay(vec![Message::text("No posts yet.")]);
                }
                let msgs = posts
                    .iter()
                    .enumerate()
                    .rev()
                    .take(20)
                    .map(|(i, p)| {
                        let headline: String = p.text.chars().take(40).collect();
                        Message::text(format!(
                            "{:>3} {} {} - {}",
                            i + 1,
                            p.posted_at.format("%Y-%m-%d"),
                            p.author,
                            headline
                        ))
                    })
                    .collect();
                AdapterReply::stay(msgs)
            }
            "read" => {
                let posts = self.load_posts().await;
                let Some(n) = rest.parse::<usize>().ok().filter(|n| (1..=posts.len()).contains(n))
                else {
                    return AdapterReply::stay(vec![Message::text("Usage: read <post number>")]);
                };
                let p = &posts[n - 1];
                AdapterReply::stay(vec![
                    Message::text(format!("From {} on {}:", p.author, p.posted_at.format("%Y-%m-%d %H:%M"))),
                    Message::text(p.text.clone()),
                ])
            }
            "post" => {
                if rest.is_empty() {
                    return AdapterReply::stay(vec![Message::text("Usage: post <text>")]);
                }
                let mut posts = self.load_posts().await;
                posts.push(BoardPost {
                    author: username.to_string(),
                    text: rest.to_string(),
                    posted_at: Utc::now(),
                });
                let start = posts.len().saturating_sub(MAX_POSTS);
                let posts = posts.split_off(start);
                match self.save_posts(&posts).await {
                    Ok(()) => AdapterReply::stay(vec![Message::text("Posted.")]),
                    Err(e) => AdapterReply::stay(vec![Message::text(format!("Post failed: {e}"))]),
                }
            }
            _ => AdapterReply::stay(vec![Message::text(
                "Commands: list, read <n>, post <text>, quit.",
            )]),
        }
    }

    async fn load_posts(&self) -> Vec<BoardPost> {
        match self.files.read(BOARD_USER, BOARD_PATH).await {
            Ok(Some(f)) => serde_json::from_str(&f.content).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    async fn save_posts(&self, posts: &[BoardPost]) -> crate::error::AppResult<()> {
        let content = serde_json::to_string(posts)?;
        self.files
            .write(crate::models::user::VirtualFile {
                username: BOARD_USER.to_string(),
                path: BOARD_PATH.to_string(),
                content,
                is_dir: false,
                mod_time: Utc::now(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn manager() -> BoardManager {
        BoardManager::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn post_list_read_round_trip() {
        let bm = manager();
        let id = SessionId::new();
        bm.open(&id).await;
        bm.handle_input(&id, "ada", "post hello from ada").await;
        let reply = bm.handle_input(&id, "ada", "list").await;
        assert!(reply.messages.iter().any(|m| m.content.contains("hello from ada")));
        let reply = bm.handle_input(&id, "ada", "read 1").await;
        assert!(reply.messages.iter().any(|m| m.content == "hello from ada"));
    }

    #[tokio::test]
    async fn quit_leaves_board_mode() {
        let bm = manager();
        let id = SessionId::new();
        bm.open(&id).await;
        let reply = bm.handle_input(&id, "ada", "quit").await;
        assert!(reply.exited);
        assert!(!bm.is_active(&id));
    }
}
