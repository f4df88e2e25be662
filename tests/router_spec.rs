use retroterm::chess::ScriptedEngine;
use retroterm::config::Config;
use retroterm::input::router::execute_with_context;
use retroterm::models::message::MessageKind;
use retroterm::models::types::{SessionId, TerminalDims};
use retroterm::net::sink::BufferSink;
use retroterm::services::chat::OfflineChatBackend;
use retroterm::state::registry::Registry;
use retroterm::state::session::InputMode;
use retroterm::store::memory::MemoryStore;
use std::sync::Arc;

fn registry_with_sink() -> (Arc<Registry>, Arc<BufferSink>) {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(BufferSink::new());
    let registry = Arc::new(Registry::new(
        Arc::new(Config::default()),
        store.clone(),
        store,
        sink.clone(),
        Arc::new(OfflineChatBackend),
        Arc::new(ScriptedEngine),
    ));
    (registry, sink)
}

async fn settle() {
    for _ in 0..30 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn whitelisted_commands_work_without_a_session() {
    let (registry, _sink) = registry_with_sink();
    let ghost = SessionId::new();

    let msgs = execute_with_context(&registry, &ghost, "help").await;
    assert!(msgs.iter().any(|m| m.content.contains("Available commands")));

    let msgs = execute_with_context(&registry, &ghost, "echo hi there").await;
    assert_eq!(msgs[0].content, "hi there");

    // Nothing was persisted for the ghost session
    assert!(!registry.validate_session(&ghost));

    let msgs = execute_with_context(&registry, &ghost, "ls").await;
    assert!(msgs.iter().any(|m| m.kind == MessageKind::Session));
}

#[tokio::test]
async fn unknown_command_is_one_wrapped_message() {
    let (registry, _sink) = registry_with_sink();
    let id = registry.create_guest("ip");
    let msgs = execute_with_context(&registry, &id, "frobnicate now").await;
    assert_eq!(msgs.len(), 1);
    assert!(msgs[0].content.contains("Unknown command 'frobnicate'"));
}

#[tokio::test]
async fn break_token_is_silently_absorbed() {
    let (registry, _sink) = registry_with_sink();
    let id = registry.create_guest("ip");
    let msgs = execute_with_context(&registry, &id, "__BREAK__").await;
    assert!(msgs.is_empty());
}

#[tokio::test]
async fn pager_quit_scenario() {
    let (registry, _sink) = registry_with_sink();
    let id = registry.create_guest("ip");
    // A file taller than one page
    let content = (1..=100)
        .map(|i| format!("line {i}"))
        .collect::<Vec<_>>()
        .join("\n");
    registry.services.vfs.ensure_home("guest").await.unwrap();
    registry
        .services
        .vfs
        .write_file("guest", "/home/guest/big.txt", &content)
        .await
        .unwrap();

    let msgs = execute_with_context(&registry, &id, "cat big.txt").await;
    assert!(msgs.iter().any(|m| m.kind == MessageKind::Pager && m.content == "activate"));
    assert_eq!(registry.get_input_mode(&id), Some(InputMode::Pager));

    let msgs = execute_with_context(&registry, &id, "q").await;
    assert!(msgs.iter().any(|m| m.kind == MessageKind::Pager && m.content == "deactivate"));
    assert!(msgs.iter().any(|m| m.kind == MessageKind::Prompt));
    assert_eq!(registry.get_input_mode(&id), Some(InputMode::OsShell));
    assert!(!registry.pagers.is_active(&id));
}

#[tokio::test]
async fn reconnect_race_scenario() {
    let (registry, _sink) = registry_with_sink();
    let id = registry.create_guest("ip");

    let msgs = execute_with_context(&registry, &id, "edit notes.txt").await;
    assert!(msgs.iter().any(|m| m.kind == MessageKind::Editor));
    assert_eq!(registry.get_input_mode(&id), Some(InputMode::Editor));

    // Transport disconnect: the mode reset happens before subsystem
    // teardown finishes, so a reconnect sees a clean shell
    registry.cleanup_session_resources(&id).await;
    assert_eq!(registry.get_input_mode(&id), Some(InputMode::OsShell));
    assert!(!registry.editors.is_active(&id));

    // The same session id keeps working at the shell
    let msgs = execute_with_context(&registry, &id, "pwd").await;
    assert_eq!(msgs[0].content, "/home/guest");
}

#[tokio::test]
async fn cleanup_postcondition_across_all_maps() {
    let (registry, _sink) = registry_with_sink();
    let id = registry.create_guest("ip");
    execute_with_context(&registry, &id, "basic").await;
    registry.cleanup_session_resources(&id).await;

    assert_eq!(registry.get_input_mode(&id), Some(InputMode::OsShell));
    assert!(!registry.basic.is_active(&id));
    assert!(!registry.editors.is_active(&id));
    assert!(!registry.pagers.is_active(&id));
    assert!(!registry.chess.is_active(&id));
    assert!(!registry.boards.is_active(&id));
    assert!(!registry.auth_flows.has_any(&id));
    assert!(!registry.telnet.has(&id));
}

#[tokio::test]
async fn interactive_registration_and_login_flow() {
    let (registry, _sink) = registry_with_sink();
    let id = registry.create_guest("ip");

    execute_with_context(&registry, &id, "register").await;
    assert_eq!(registry.get_input_mode(&id), Some(InputMode::RegistrationProcess));
    execute_with_context(&registry, &id, "grace").await;
    execute_with_context(&registry, &id, "hopper1").await;
    let msgs = execute_with_context(&registry, &id, "hopper1").await;
    assert!(msgs.iter().any(|m| m.content.contains("created")));
    assert_eq!(registry.get_input_mode(&id), Some(InputMode::OsShell));

    execute_with_context(&registry, &id, "login").await;
    assert_eq!(registry.get_input_mode(&id), Some(InputMode::LoginProcess));
    execute_with_context(&registry, &id, "grace").await;
    let msgs = execute_with_context(&registry, &id, "hopper1").await;
    assert!(msgs.iter().any(|m| m.kind == MessageKind::AuthRefresh));
    assert_eq!(registry.get_input_mode(&id), Some(InputMode::OsShell));
    assert_eq!(registry.username_of(&id).as_deref(), Some("grace"));

    let msgs = execute_with_context(&registry, &id, "whoami").await;
    assert_eq!(msgs[0].content, "grace");
}

#[tokio::test]
async fn basic_mode_round_trip_through_router() {
    let (registry, sink) = registry_with_sink();
    let id = registry.create_guest("ip");

    let msgs = execute_with_context(&registry, &id, "basic").await;
    assert!(msgs.iter().any(|m| m.content.contains("RETROTERM BASIC")));
    assert_eq!(registry.get_input_mode(&id), Some(InputMode::BasicInterpreter));

    execute_with_context(&registry, &id, "10 PRINT 6*7").await;
    execute_with_context(&registry, &id, "RUN").await;
    settle().await;
    let pushed = sink.for_session(&id);
    assert!(pushed.iter().any(|m| m.content == "42"), "{pushed:?}");

    // ESC exits BASIC and the triggering input reaches no other subsystem
    let msgs = execute_with_context(&registry, &id, "\x1b").await;
    assert!(msgs.iter().any(|m| m.content.contains("Exiting BASIC")));
    assert_eq!(registry.get_input_mode(&id), Some(InputMode::OsShell));
    assert!(!registry.basic.is_active(&id));
}

#[tokio::test]
async fn temporary_user_login_is_not_persisted() {
    let (registry, _sink) = registry_with_sink();
    let store_probe = registry.users.clone();
    registry
        .services
        .auth
        .register("dyson", "freeman", "ip")
        .await
        .unwrap();
    let id = registry.create_guest("ip");
    let msgs = execute_with_context(&registry, &id, "login dyson freeman").await;
    assert_eq!(registry.username_of(&id).as_deref(), Some("dyson"));

    // The issued token is flagged temporary and never lands in
    // user_sessions
    let token_msg = msgs
        .iter()
        .find(|m| m.kind == MessageKind::AuthRefresh)
        .expect("auth refresh message");
    assert_eq!(
        token_msg.params.as_ref().and_then(|p| p.get("temporary")),
        Some(&serde_json::Value::Bool(true))
    );
    assert!(store_probe
        .load_session(&token_msg.content)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn chess_and_board_modes_route_and_exit() {
    let (registry, _sink) = registry_with_sink();
    let id = registry.create_guest("ip");

    execute_with_context(&registry, &id, "chess").await;
    assert_eq!(registry.get_input_mode(&id), Some(InputMode::Chess));
    let msgs = execute_with_context(&registry, &id, "e2e4").await;
    assert!(msgs.iter().any(|m| m.content.contains("1. e2e4")));
    execute_with_context(&registry, &id, "quit").await;
    assert_eq!(registry.get_input_mode(&id), Some(InputMode::OsShell));

    execute_with_context(&registry, &id, "board").await;
    assert_eq!(registry.get_input_mode(&id), Some(InputMode::Board));
    execute_with_context(&registry, &id, "post first!").await;
    let msgs = execute_with_context(&registry, &id, "list").await;
    assert!(msgs.iter().any(|m| m.content.contains("first!")));
    execute_with_context(&registry, &id, "quit").await;
    assert_eq!(registry.get_input_mode(&id), Some(InputMode::OsShell));
}

#[tokio::test]
async fn terminal_dims_default_and_update() {
    let (registry, _sink) = registry_with_sink();
    let id = registry.create_guest("ip");
    assert_eq!(registry.dims_of(&id), Some(TerminalDims { cols: 80, rows: 24 }));
    registry.set_dims(&id, TerminalDims { cols: 132, rows: 43 });
    assert_eq!(registry.dims_of(&id), Some(TerminalDims { cols: 132, rows: 43 }));
}
