pub mod compiler;
pub mod error;
pub mod funcs;
pub mod opcode;
pub mod program;
pub mod value;
pub mod vm;

use crate::basic::program::{SourceProgram, split_line_number};
use crate::basic::vm::{RunOutcome, Vm};
use crate::error::AppResult;
use crate::input::{AdapterReply, is_exit_key};
use crate::models::message::Message;
use crate::models::types::SessionId;
use crate::models::user::VirtualFile;
use crate::net::sink::ClientSink;
use crate::services::quota::QuotaService;
use crate::store::FileStore;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

const READY: &str = "READY.";

enum RunState {
    Idle,
    Running { cancel: watch::Sender<bool> },
    Awaiting { vm: Box<Vm> },
}

/// Outcome of the guard-scoped phase of input handling. Store I/O happens
/// after the session entry guard is released.
enum Planned {
    Reply(AdapterReply),
    Save { username: String, name: String, listing: String },
    Load { username: String, name: String },
}

struct BasicSession {
    source: SourceProgram,
    run: RunState,
    username: String,
}

/// Owns every session's BASIC interpreter state: the editable source
/// program and, while a program runs, the VM task handle. Program output
/// streams through the [`ClientSink`]; the interpreter itself answers the
/// immediate commands (RUN, LIST, NEW, SAVE, LOAD) in-batch.
pub struct BasicManager {
    sink: Arc<dyn ClientSink>,
    quota: Arc<QuotaService>,
    files: Arc<dyn FileStore>,
    sessions: Arc<DashMap<SessionId, BasicSession>>,
}

impl BasicManager {
    pub fn new(
        sink: Arc<dyn ClientSink>,
        quota: Arc<QuotaService>,
        files: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            sink,
            quota,
            files,
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn is_active(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Enter BASIC mode for a session. Counts against the BASIC caps.
    pub fn enter(&self, id: &SessionId, username: &str, is_guest: bool) -> AppResult<Vec<Message>> {
        self.quota.start_basic_session(id, is_guest)?;
        self.sessions.insert(
            id.clone(),
            BasicSession {
                source: SourceProgram::new(),
                run: RunState::Idle,
                username: username.to_string(),
            },
        );
        Ok(vec![
            Message::mode("basic:start"),
            Message::text("RETROTERM BASIC 1.0"),
            Message::text(READY),
        ])
    }

    /// Tear down a session's BASIC state. Safe to call twice; cancels a
    /// running program.
    pub fn remove(&self, id: &SessionId) {
        if let Some((_, sess)) = self.sessions.remove(id) {
            if let RunState::Running { cancel } = sess.run {
                let _ = cancel.send(true);
            }
        }
        self.quota.end_basic_session(id);
    }

    pub async fn handle_input(&self, id: &SessionId, input: &str) -> AdapterReply {
        if is_exit_key(input) || matches!(input.trim().to_uppercase().as_str(), "EXIT" | "QUIT" | "SYSTEM" | "BYE") {
            self.remove(id);
            return AdapterReply::exit(vec![
                Message::mode("basic:end"),
                Message::text("Exiting BASIC."),
            ]);
        }

        // Synchronous phase under the entry guard; SAVE/LOAD finish with
        // store I/O after the guard is gone.
        let planned = {
            let Some(mut entry) = self.sessions.get_mut(id) else {
                // No state for this session; tell the router to heal the mode
                return AdapterReply::exit(vec![]);
            };
            self.plan_input(&mut entry, id, input)
        };

        match planned {
            Planned::Reply(reply) => reply,
            Planned::Save { username, name, listing } => {
                self.save_program(&username, &name, listing).await
            }
            Planned::Load { username, name } => self.load_program(id, &username, &name).await,
        }
    }

    fn plan_input(&self, entry: &mut BasicSession, id: &SessionId, input: &str) -> Planned {
        match std::mem::replace(&mut entry.run, RunState::Idle) {
            RunState::Running { cancel } => {
                // The only thing a running program listens for is a break
                if input.trim().eq_ignore_ascii_case("STOP") {
                    let _ = cancel.send(true);
                }
                entry.run = RunState::Running { cancel };
                Planned::Reply(AdapterReply::stay(vec![]))
            }
            RunState::Awaiting { mut vm } => {
                if let Err(e) = vm.resume(input) {
                    entry.run = RunState::Awaiting { vm };
                    return Planned::Reply(AdapterReply::stay(vec![Message::text(format!("?{e}"))]));
                }
                let (cancel_tx, cancel_rx) = watch::channel(false);
                entry.run = RunState::Running { cancel: cancel_tx };
                self.spawn_vm(id.clone(), vm, cancel_rx);
                Planned::Reply(AdapterReply::stay(vec![]))
            }
            RunState::Idle => self.plan_idle_input(entry, id, input),
        }
    }

    fn plan_idle_input(&self, entry: &mut BasicSession, id: &SessionId, input: &str) -> Planned {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Planned::Reply(AdapterReply::stay(vec![]));
        }

        // A leading line number edits the program: upsert, or delete when
        // the rest of the line is empty
        if let Some((number, rest)) = split_line_number(trimmed) {
            if rest.is_empty() {
                entry.source.delete(number);
            } else {
                entry.source.upsert(number, rest);
            }
            return Planned::Reply(AdapterReply::stay(vec![]));
        }

        let mut it = trimmed.split_whitespace();
        let verb = it.next().unwrap_or_default().to_uppercase();
        let arg = it.next().unwrap_or_default().to_string();
        match verb.as_str() {
            "RUN" => Planned::Reply(self.start_run(entry, id)),
            "LIST" => {
                let listing = entry.source.listing();
                let mut msgs: Vec<Message> = listing.lines().map(Message::text).collect();
                msgs.push(Message::text(READY));
                Planned::Reply(AdapterReply::stay(msgs))
            }
            "NEW" => {
                entry.source.clear();
                Planned::Reply(AdapterReply::stay(vec![Message::text(READY)]))
            }
            "SAVE" => Planned::Save {
                username: entry.username.clone(),
                name: arg,
                listing: entry.source.listing(),
            },
            "LOAD" => Planned::Load {
                username: entry.username.clone(),
                name: arg,
            },
            _ => Planned::Reply(AdapterReply::stay(vec![Message::text("?SYNTAX ERROR")])),
        }
    }

    fn start_run(&self, entry: &mut BasicSession, id: &SessionId) -> AdapterReply {
        if entry.source.is_empty() {
            return AdapterReply::stay(vec![Message::text(READY)]);
        }
        let bytecode = match compiler::compile(&entry.source) {
            Ok(bc) => Arc::new(bc),
            Err(e) => {
                return AdapterReply::stay(vec![Message::text(e.to_string()), Message::text(READY)]);
            }
        };
        let vm = Box::new(Vm::new(bytecode));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        entry.run = RunState::Running { cancel: cancel_tx };
        self.spawn_vm(id.clone(), vm, cancel_rx);
        AdapterReply::stay(vec![])
    }

    /// Run the VM on its own task. PRINT output and media messages stream
    /// through the sink as they happen; the interpreter state is updated
    /// when the task settles.
    fn spawn_vm(&self, id: SessionId, mut vm: Box<Vm>, cancel_rx: watch::Receiver<bool>) {
        let sessions = self.sessions.clone();
        let done_sink = self.sink.clone();
        let (tx, mut rx) = mpsc::channel::<Message>(64);

        let fwd_sink = self.sink.clone();
        let fwd_id = id.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if fwd_sink.send(&fwd_id, msg).await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let outcome = vm.run(&tx, &cancel_rx).await;
            let Some(mut entry) = sessions.get_mut(&id) else {
                // Session left BASIC while we ran; nothing to update
                return;
            };
            match outcome {
                Ok(RunOutcome::Done) => {
                    entry.run = RunState::Idle;
                    drop(entry);
                    let _ = done_sink.send(&id, Message::text(READY)).await;
                }
                Ok(RunOutcome::AwaitingInput { .. }) => {
                    entry.run = RunState::Awaiting { vm };
                }
                Ok(RunOutcome::Cancelled) => {
                    entry.run = RunState::Idle;
                    drop(entry);
                    let _ = done_sink.send(&id, Message::text("BREAK")).await;
                    let _ = done_sink.send(&id, Message::text(READY)).await;
                }
                Err(e) => {
                    entry.run = RunState::Idle;
                    drop(entry);
                    let _ = done_sink.send(&id, Message::text(e.to_string())).await;
                    let _ = done_sink.send(&id, Message::text(READY)).await;
                }
            }
        });
    }

    async fn save_program(&self, username: &str, name: &str, listing: String) -> AdapterReply {
        if name.is_empty() {
            return AdapterReply::stay(vec![Message::text("?SAVE needs a file name")]);
        }
        let path = format!("/home/{username}/{}", normalize_basic_name(name));
        let file = VirtualFile {
            username: username.to_string(),
            path,
            content: listing,
            is_dir: false,
            mod_time: chrono::Utc::now(),
        };
        match self.files.write(file).await {
            Ok(()) => AdapterReply::stay(vec![Message::text("SAVED"), Message::text(READY)]),
            Err(e) => AdapterReply::stay(vec![Message::text(format!("?SAVE failed: {e}"))]),
        }
    }

    async fn load_program(&self, id: &SessionId, username: &str, name: &str) -> AdapterReply {
        if name.is_empty() {
            return AdapterReply::stay(vec![Message::text("?LOAD needs a file name")]);
        }
        let path = format!("/home/{username}/{}", normalize_basic_name(name));
        match self.files.read(username, &path).await {
            Ok(Some(file)) if !file.is_dir => {
                let source = SourceProgram::from_listing(&file.content);
                let count = source.len();
                if let Some(mut entry) = self.sessions.get_mut(id) {
                    entry.source = source;
                }
                AdapterReply::stay(vec![
                    Message::text(format!("LOADED {count} LINES")),
                    Message::text(READY),
                ])
            }
            Ok(_) => AdapterReply::stay(vec![Message::text("?FILE NOT FOUND")]),
            Err(e) => AdapterReply::stay(vec![Message::text(format!("?LOAD failed: {e}"))]),
        }
    }

    /// Preload a program from the virtual filesystem and start it, as the
    /// shell's `run <file>` does.
    pub async fn enter_and_run(
        &self,
        id: &SessionId,
        username: &str,
        is_guest: bool,
        content: &str,
    ) -> AppResult<Vec<Message>> {
        let mut msgs = self.enter(id, username, is_guest)?;
        let source = SourceProgram::from_listing(content);
        if source.is_empty() {
            msgs.push(Message::text("?NO PROGRAM LINES IN FILE"));
            return Ok(msgs);
        }
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.source = source;
            let reply = self.start_run(&mut entry, id);
            msgs.extend(reply.messages);
        }
        Ok(msgs)
    }
}

/// BASIC file names get a `.bas` suffix when none was given.
fn normalize_basic_name(name: &str) -> String {
    let quoted = name.trim_matches('"');
    if quoted.contains('.') {
        quoted.to_string()
    } else {
        format!("{quoted}.bas")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;
    use crate::net::sink::BufferSink;
    use crate::store::memory::MemoryStore;

    fn manager() -> (Arc<BasicManager>, Arc<BufferSink>) {
        let sink = Arc::new(BufferSink::new());
        let quota = Arc::new(QuotaService::new(LimitsConfig::default()));
        let files = Arc::new(MemoryStore::new());
        (
            Arc::new(BasicManager::new(sink.clone(), quota, files)),
            sink,
        )
    }

    async fn settle() {
        // Let the VM task and forwarder drain
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn program_entry_run_and_ready() {
        let (mgr, sink) = manager();
        let id = SessionId::new();
        mgr.enter(&id, "guest", true).unwrap();
        mgr.handle_input(&id, "10 PRINT 2+3").await;
        mgr.handle_input(&id, "20 END").await;
        let reply = mgr.handle_input(&id, "RUN").await;
        assert!(!reply.exited);
        settle().await;
        let texts: Vec<String> = sink.for_session(&id).iter().map(|m| m.content.clone()).collect();
        assert!(texts.contains(&"5".to_string()));
        assert!(texts.contains(&READY.to_string()));
    }

    #[tokio::test]
    async fn line_edit_is_upsert_and_delete() {
        let (mgr, _sink) = manager();
        let id = SessionId::new();
        mgr.enter(&id, "guest", true).unwrap();
        mgr.handle_input(&id, "10 PRINT 1").await;
        mgr.handle_input(&id, "10 PRINT 2").await;
        let reply = mgr.handle_input(&id, "LIST").await;
        let listing: Vec<&str> = reply.messages.iter().map(|m| m.content.as_str()).collect();
        assert!(listing.contains(&"10 PRINT 2"));
        mgr.handle_input(&id, "10").await;
        let reply = mgr.handle_input(&id, "LIST").await;
        assert!(!reply.messages.iter().any(|m| m.content.starts_with("10 ")));
    }

    #[tokio::test]
    async fn exit_keys_leave_basic() {
        let (mgr, _sink) = manager();
        let id = SessionId::new();
        mgr.enter(&id, "guest", true).unwrap();
        let reply = mgr.handle_input(&id, "\x1b").await;
        assert!(reply.exited);
        assert!(!mgr.is_active(&id));
    }

    #[tokio::test]
    async fn input_prompt_round_trip_through_manager() {
        let (mgr, sink) = manager();
        let id = SessionId::new();
        mgr.enter(&id, "guest", true).unwrap();
        mgr.handle_input(&id, "10 INPUT \"n\"; X").await;
        mgr.handle_input(&id, "20 PRINT X+1").await;
        mgr.handle_input(&id, "RUN").await;
        settle().await;
        mgr.handle_input(&id, "41").await;
        settle().await;
        let texts: Vec<String> = sink.for_session(&id).iter().map(|m| m.content.clone()).collect();
        assert!(texts.contains(&"42".to_string()), "{texts:?}");
    }

    #[tokio::test]
    async fn runaway_program_is_cancelled_on_remove() {
        let (mgr, _sink) = manager();
        let id = SessionId::new();
        mgr.enter(&id, "guest", true).unwrap();
        mgr.handle_input(&id, "10 GOTO 10").await;
        mgr.handle_input(&id, "RUN").await;
        settle().await;
        mgr.remove(&id);
        settle().await;
        assert!(!mgr.is_active(&id));
        assert_eq!(mgr.quota.basic_in_use(), 0);
    }

    #[tokio::test]
    async fn compile_error_reports_line() {
        let (mgr, _sink) = manager();
        let id = SessionId::new();
        mgr.enter(&id, "guest", true).unwrap();
        mgr.handle_input(&id, "10 GOTO 999").await;
        let reply = mgr.handle_input(&id, "RUN").await;
        assert!(reply.messages.iter().any(|m| m.content.contains("SYNTAX")));
    }
}
