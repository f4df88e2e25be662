pub mod auth_flow;
pub mod basic;
pub mod board;
pub mod chess;
pub mod commands;
pub mod config;
pub mod editor;
pub mod error;
pub mod input;
pub mod models;
pub mod net;
pub mod pager;
pub mod services;
pub mod state;
pub mod store;
pub mod util;

// Convenient re-exports (so call sites can do `retroterm::Registry`, etc.)
pub use commands::process_command;
pub use input::router::execute_with_context;
pub use models::message::{Message, MessageKind};
pub use models::types::{SessionId, TerminalDims};
pub use state::{
    registry::Registry,
    session::{InputMode, Session},
};
