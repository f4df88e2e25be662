use crate::models::message::Message;
use crate::models::types::SessionId;
use parking_lot::Mutex;

/// Outbound push contract to the client transport. Most subsystems return
/// message batches synchronously; the telnet reader and the BASIC VM push
/// unsolicited messages through this instead.
///
/// Implementations must not block: slow clients are the transport's
/// problem, not the core's.
#[async_trait::async_trait]
pub trait ClientSink: Send + Sync {
    async fn send(&self, session_id: &SessionId, message: Message) -> anyhow::Result<()>;
}

/// Sink that buffers everything in memory. Used by tests and as a harmless
/// default.
#[derive(Default)]
pub struct BufferSink {
    messages: Mutex<Vec<(SessionId, Message)>>,
}

impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(SessionId, Message)> {
        let mut guard = self.messages.lock();
        std::mem::take(&mut *guard)
    }

    pub fn for_session(&self, id: &SessionId) -> Vec<Message> {
        self.messages
            .lock()
            .iter()
            .filter(|(sid, _)| sid == id)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl ClientSink for BufferSink {
    async fn send(&self, session_id: &SessionId, message: Message) -> anyhow::Result<()> {
        self.messages.lock().push((session_id.clone(), message));
        Ok(())
    }
}
