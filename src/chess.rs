use crate::input::{AdapterReply, is_exit_key};
use crate::models::message::Message;
use crate::models::types::SessionId;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

static MOVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-h][1-8][a-h][1-8][qrbn]?$").expect("move regex"));

/// One game in progress. The engine's internals live outside the core; the
/// adapter only needs these two operations.
pub trait ChessGame: Send + Sync {
    /// Render the current board for a text terminal.
    fn board(&self) -> String;
    /// Apply a move in coordinate notation; returns the engine's reply
    /// rendering or a rejection reason.
    fn try_move(&mut self, mv: &str) -> Result<String, String>;
}

/// Factory for games; the real engine is plugged in by the host.
pub trait ChessEngine: Send + Sync {
    fn start(&self) -> Box<dyn ChessGame>;
}

/// Adapter that owns the input stream while a session is in chess mode.
pub struct ChessManager {
    engine: Arc<dyn ChessEngine>,
    games: DashMap<SessionId, Box<dyn ChessGame>>,
}

impl ChessManager {
    pub fn new(engine: Arc<dyn ChessEngine>) -> Self {
        Self {
            engine,
            games: DashMap::new(),
        }
    }

    pub fn is_active(&self, id: &SessionId) -> bool {
        self.games.contains_key(id)
    }

    pub fn remove(&self, id: &SessionId) {
        self.games.remove(id);
    }

    pub fn open(&self, id: &SessionId) -> Vec<Message> {
        let game = self.engine.start();
        let board = game.board();
        self.games.insert(id.clone(), game);
        vec![
            Message::mode("chess:start"),
            Message::text(board),
            Message::text("Moves in coordinate notation (e2e4). 'board' redraws, 'quit' leaves."),
        ]
    }

    pub fn handle_input(&self, id: &SessionId, input: &str) -> AdapterReply {
        let cmd = input.trim().to_lowercase();
        if is_exit_key(input) || cmd == "quit" || cmd == "resign" {
            self.games.remove(id);
            return AdapterReply::exit(vec![
                Message::mode("chess:end"),
                Message::text("Game over. Back to the shell."),
            ]);
        }
        let Some(mut game) = self.games.get_mut(id) else {
            return AdapterReply::exit(vec![]);
        };
        match cmd.as_str() {
            "board" => AdapterReply::stay(vec![Message::text(game.board())]),
            "help" => AdapterReply::stay(vec![Message::text(
                "Enter moves like e2e4 (append q/r/b/n to promote). 'board', 'resign', 'quit'.",
            )]),
            mv if MOVE_RE.is_match(mv) => match game.try_move(mv) {
                Ok(rendered) => AdapterReply::stay(vec![Message::text(rendered)]),
                Err(reason) => AdapterReply::stay(vec![Message::text(format!("Illegal move: {reason}"))]),
            },
            _ => AdapterReply::stay(vec![Message::text(
                "That is not a move. Try e2e4, or 'help'.",
            )]),
        }
    }
}

/// Minimal stand-in engine: tracks moves, renders a fixed start position
/// header plus the move list. Good enough to exercise the adapter; the
/// production engine replaces it through [`ChessEngine`].
pub struct ScriptedEngine;

struct ScriptedGame {
    moves: Vec<String>,
}

impl ChessEngine for ScriptedEngine {
    fn start(&self) -> Box<dyn ChessGame> {
        Box::new(ScriptedGame { moves: Vec::new() })
    }
}

impl ChessGame for ScriptedGame {
    fn board(&self) -> String {
        let mut out = String::from(
            "  +------------------------+\n\
             8 | r n b q k b n r        |\n\
             7 | p p p p p p p p        |\n\
             6 | . . . . . . . .        |\n\
             5 | . . . . . . . .        |\n\
             4 | . . . . . . . .        |\n\
             3 | . . . . . . . .        |\n\
             2 | P P P P P P P P        |\n\
             1 | R N B Q K B N R        |\n\
               +------------------------+\n",
        );
        if !self.moves.is_empty() {
            out.push_str(&format!("moves: {}\n", self.moves.join(" ")));
        }
        out
    }

    fn try_move(&mut self, mv: &str) -> Result<String, String> {
        if mv.get(0..2) == mv.get(2..4) {
            return Err("a piece has to move somewhere".into());
        }
        self.moves.push(mv.to_string());
        Ok(format!("{}. {}\n{}", self.moves.len(), mv, self.board()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ChessManager {
        ChessManager::new(Arc::new(ScriptedEngine))
    }

    #[test]
    fn open_renders_a_board() {
        let cm = manager();
        let id = SessionId::new();
        let msgs = cm.open(&id);
        assert!(msgs.iter().any(|m| m.content.contains("8 | r n b q")));
        assert!(cm.is_active(&id));
    }

    #[test]
    fn legal_shape_moves_reach_the_engine() {
        let cm = manager();
        let id = SessionId::new();
        cm.open(&id);
        let reply = cm.handle_input(&id, "e2e4");
        assert!(reply.messages[0].content.contains("1. e2e4"));
        let reply = cm.handle_input(&id, "not-a-move");
        assert!(reply.messages[0].content.contains("not a move"));
    }

    #[test]
    fn quit_and_exit_keys_leave_chess() {
        let cm = manager();
        let id = SessionId::new();
        cm.open(&id);
        let reply = cm.handle_input(&id, "quit");
        assert!(reply.exited);
        assert!(!cm.is_active(&id));

        cm.open(&id);
        let reply = cm.handle_input(&id, "\x1b");
        assert!(reply.exited);
        assert!(!cm.is_active(&id));
    }
}
