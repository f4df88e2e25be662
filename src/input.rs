pub mod router;

use crate::models::message::Message;

/// What a subsystem adapter hands back to the input router: an ordered
/// message batch, and whether the subsystem has exited. On exit the router
/// resets the session to shell mode and does not forward the triggering
/// input anywhere else.
#[derive(Debug, Default)]
pub struct AdapterReply {
    pub messages: Vec<Message>,
    pub exited: bool,
}

impl AdapterReply {
    pub fn stay(messages: Vec<Message>) -> Self {
        Self { messages, exited: false }
    }

    pub fn exit(messages: Vec<Message>) -> Self {
        Self { messages, exited: true }
    }
}

/// Ctrl+X and ESC leave any subsystem, everywhere.
pub fn is_exit_key(input: &str) -> bool {
    input.bytes().any(|b| b == 0x18 || b == 0x1b)
}
