pub mod iac;

use crate::input::{AdapterReply, is_exit_key};
use crate::models::message::Message;
use crate::models::types::SessionId;
use crate::net::sink::ClientSink;
use crate::net::telnet::iac::{IacEvent, IacFilter};
use crate::services::quota::QuotaService;
use crate::state::registry::Registry;
use crate::state::session::InputMode;
use bytes::BytesMut;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::timeout;

pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// The caller of HandleTelnetInput never waits longer than this.
pub const INPUT_WAIT: Duration = Duration::from_secs(5);
pub const READ_DEADLINE: Duration = Duration::from_secs(120);
pub const IDLE_LIMIT: Duration = Duration::from_secs(600);
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(30);
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
/// Drop-on-timeout window for the bounded output channel.
pub const CHANNEL_SEND_TIMEOUT: Duration = Duration::from_millis(100);
pub const OUTPUT_CHANNEL_CAPACITY: usize = 1000;
const MAX_CONSECUTIVE_READ_ERRORS: u32 = 3;

/// One live outbound telnet connection. Either the connection is present
/// and the session is in telnet mode, or the state is absent; the health
/// monitor and the reconciliation sweep repair anything in between.
pub struct TelnetState {
    pub server_name: String,
    pub host_port: String,
    pub session_id: SessionId,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    last_activity: AtomicI64,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Bounded secondary delivery path; `None` once closed.
    out_tx: parking_lot::Mutex<Option<mpsc::Sender<Message>>>,
    out_rx: parking_lot::Mutex<Option<mpsc::Receiver<Message>>>,
    shutdown: watch::Sender<bool>,
    pub server_echo: AtomicBool,
}

impl TelnetState {
    fn touch(&self) {
        self.last_activity
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_activity.load(Ordering::Relaxed);
        let now = chrono::Utc::now().timestamp();
        Duration::from_secs((now - last).max(0) as u64)
    }

    fn signal_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Push on the bounded channel, dropping rather than back-pressuring
    /// the reader.
    async fn channel_send(&self, msg: Message) {
        let tx = self.out_tx.lock().clone();
        if let Some(tx) = tx {
            if let Err(e) = tx.send_timeout(msg, CHANNEL_SEND_TIMEOUT).await {
                tracing::debug!(session_id = %self.session_id, error = %e, "telnet output channel full, dropping");
            }
        }
    }

    /// Hand the channel consumer end to the transport, once.
    pub fn take_output(&self) -> Option<mpsc::Receiver<Message>> {
        self.out_rx.lock().take()
    }
}

/// Per-session outbound telnet proxy: dials configured remotes, negotiates
/// the minimal option set, and bridges bytes between the remote and the
/// client sink without ever blocking a transport worker.
pub struct TelnetProxy {
    sink: Arc<dyn ClientSink>,
    quota: Arc<QuotaService>,
    states: DashMap<SessionId, Arc<TelnetState>>,
}

impl TelnetProxy {
    pub fn new(sink: Arc<dyn ClientSink>, quota: Arc<QuotaService>) -> Self {
        Self {
            sink,
            quota,
            states: DashMap::new(),
        }
    }

    pub fn has(&self, id: &SessionId) -> bool {
        self.states.contains_key(id)
    }

    pub fn state_of(&self, id: &SessionId) -> Option<Arc<TelnetState>> {
        self.states.get(id).map(|e| e.value().clone())
    }

    pub fn active_count(&self) -> usize {
        self.states.len()
    }

    /// `telnet <key>`: validate, dial, negotiate, enter telnet mode, spawn
    /// the reader and health tasks. Returns the user-facing banner.
    pub async fn open(
        &self,
        registry: &Arc<Registry>,
        id: &SessionId,
        server_key: &str,
    ) -> Vec<Message> {
        let Some(server) = registry.config.telnet_server(server_key) else {
            let known = registry.config.telnet_server_keys().join(", ");
            return vec![Message::text(format!(
                "Unknown telnet server '{server_key}'. Available: {known}"
            ))];
        };
        if self.states.contains_key(id) {
            return vec![Message::text(
                "This session already has an open telnet connection.",
            )];
        }
        if let Err(e) = self.quota.try_acquire_telnet(id) {
            return vec![Message::text(e.to_string())];
        }

        let stream = match timeout(DIAL_TIMEOUT, TcpStream::connect(&server.host_port)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                self.quota.release_telnet(id);
                return vec![Message::text(format!(
                    "Could not connect to {}: {e}",
                    server.host_port
                ))];
            }
            Err(_) => {
                self.quota.release_telnet(id);
                return vec![Message::text(format!(
                    "Connection to {} timed out after {}s",
                    server.host_port,
                    DIAL_TIMEOUT.as_secs()
                ))];
            }
        };
        let _ = stream.set_nodelay(true);
        let (read_half, mut write_half) = stream.into_split();

        let dims = registry.dims_of(id).unwrap_or_default();
        if let Err(e) = write_half
            .write_all(&IacFilter::initial_negotiation(dims))
            .await
        {
            self.quota.release_telnet(id);
            return vec![Message::text(format!("Connection setup failed: {e}"))];
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let state = Arc::new(TelnetState {
            server_name: server.display_name.clone(),
            host_port: server.host_port.clone(),
            session_id: id.clone(),
            connected_at: chrono::Utc::now(),
            last_activity: AtomicI64::new(chrono::Utc::now().timestamp()),
            writer: Mutex::new(Some(write_half)),
            out_tx: parking_lot::Mutex::new(Some(out_tx)),
            out_rx: parking_lot::Mutex::new(Some(out_rx)),
            shutdown: shutdown_tx,
            server_echo: AtomicBool::new(false),
        });
        self.states.insert(id.clone(), state.clone());

        if let Err(e) = registry.try_set_input_mode(id, InputMode::Telnet) {
            self.force_drop(id).await;
            return vec![Message::text(e.to_string())];
        }

        self.spawn_reader(registry.clone(), state.clone(), read_half, shutdown_rx.clone());
        self.spawn_health(registry.clone(), state.clone(), shutdown_rx);
        Self::spawn_wakeup_cr(state.clone());

        tracing::info!(session_id = %id, server = %server.display_name, host = %server.host_port, "telnet session opened");
        vec![
            Message::text(format!(
                "Connected to {} ({})",
                server.display_name, server.host_port
            )),
            Message::telnet("start"),
            Message::text("Press ESC or Ctrl+X to disconnect."),
        ]
    }

    /// Forward user input to the remote. The write happens on a detached
    /// task with its own deadline; the caller waits at most [`INPUT_WAIT`].
    pub async fn handle_input(
        &self,
        registry: &Arc<Registry>,
        id: &SessionId,
        input: &str,
    ) -> AdapterReply {
        if is_exit_key(input) {
            self.exit_session(id).await;
            return AdapterReply::exit(vec![]);
        }
        let Some(state) = self.state_of(id) else {
            // Ghost mode: no state behind telnet mode, heal to shell
            return AdapterReply::exit(vec![Message::text("Telnet connection is gone.")]);
        };

        state.touch();
        let bytes = input.as_bytes().to_vec();
        let registry = registry.clone();
        let task_id = id.clone();
        let write_task = tokio::spawn(async move {
            let failed = {
                let mut guard = state.writer.lock().await;
                match guard.as_mut() {
                    Some(w) => {
                        matches!(timeout(WRITE_TIMEOUT, w.write_all(&bytes)).await, Err(_) | Ok(Err(_)))
                    }
                    None => true,
                }
            };
            if failed {
                // Write failure is fatal for the telnet session
                tracing::warn!(session_id = %task_id, "telnet write failed, closing session");
                registry.telnet.force_drop(&task_id).await;
                registry.heal_mode(&task_id);
            }
        });
        // Bounded wait; a slow socket never stalls the router
        let _ = timeout(INPUT_WAIT, write_task).await;
        AdapterReply::stay(vec![])
    }

    /// User-initiated exit (ESC / Ctrl+X). The router resets the mode.
    pub async fn exit_session(&self, id: &SessionId) {
        self.force_drop(id).await;
    }

    /// Idempotent teardown: signal shutdown, close the socket, emit the
    /// terminal "end" message via both delivery paths, drop the state.
    pub async fn cleanup(&self, id: &SessionId) {
        self.force_drop(id).await;
    }

    async fn force_drop(&self, id: &SessionId) {
        let Some((_, state)) = self.states.remove(id) else {
            return;
        };
        state.signal_shutdown();

        match timeout(LOCK_TIMEOUT, state.writer.lock()).await {
            Ok(mut guard) => {
                if let Some(mut w) = guard.take() {
                    let _ = w.shutdown().await;
                }
            }
            Err(_) => {
                tracing::error!(session_id = %id, "timed out acquiring telnet writer lock, abandoning socket");
            }
        }

        // Terminal message through both paths, then close the channel
        state.channel_send(Message::telnet("end")).await;
        *state.out_tx.lock() = None;
        let sink = self.sink.clone();
        let sid = id.clone();
        tokio::spawn(async move {
            let _ = sink.send(&sid, Message::telnet("end")).await;
        });

        self.quota.release_telnet(id);
        tracing::info!(session_id = %id, server = %state.server_name, "telnet session closed");
    }

    /// Reader task: apply the read deadline, tolerate up to three
    /// consecutive hard errors, stop on EOF or prolonged inactivity, and
    /// deliver filtered bytes both ways. Cleanup runs even if the body
    /// panics.
    fn spawn_reader(
        &self,
        registry: Arc<Registry>,
        state: Arc<TelnetState>,
        read_half: OwnedReadHalf,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            let body = tokio::spawn(reader_loop(
                registry.clone(),
                sink,
                state.clone(),
                read_half,
                shutdown_rx,
            ));
            if let Err(e) = body.await {
                tracing::error!(session_id = %state.session_id, error = %e, "telnet reader panicked");
            }
            // Async cleanup; also heals the input mode back to the shell
            registry.telnet.force_drop(&state.session_id).await;
            registry.heal_mode(&state.session_id);
        });
    }

    fn spawn_health(
        &self,
        registry: Arc<Registry>,
        state: Arc<TelnetState>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                    _ = ticker.tick() => {}
                }
                let connection_gone = match timeout(Duration::from_millis(50), state.writer.lock()).await {
                    Ok(guard) => guard.is_none(),
                    // Busy is fine; a write is in flight
                    Err(_) => false,
                };
                if connection_gone || state.idle_for() > IDLE_LIMIT {
                    tracing::warn!(
                        session_id = %state.session_id,
                        idle_secs = state.idle_for().as_secs(),
                        "telnet health check failed, shutting session down"
                    );
                    state.signal_shutdown();
                    registry.telnet.force_drop(&state.session_id).await;
                    registry.heal_mode(&state.session_id);
                    return;
                }
            }
        });
    }

    /// Interactive servers often wait for a keypress before painting their
    /// welcome screen; prod them with a CR shortly after connect.
    fn spawn_wakeup_cr(state: Arc<TelnetState>) {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let mut guard = state.writer.lock().await;
            if let Some(w) = guard.as_mut() {
                let _ = w.write_all(b"\r").await;
            }
        });
    }

    /// Sweep support: drop states whose session no longer exists or is no
    /// longer in telnet mode.
    pub async fn reconcile(&self, registry: &Registry) {
        let ids: Vec<SessionId> = self.states.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            let mode = registry.get_input_mode(&id);
            if mode != Some(InputMode::Telnet) {
                tracing::warn!(session_id = %id, ?mode, "reconciling orphaned telnet state");
                self.force_drop(&id).await;
            }
        }
    }
}

async fn reader_loop(
    registry: Arc<Registry>,
    sink: Arc<dyn ClientSink>,
    state: Arc<TelnetState>,
    mut read_half: OwnedReadHalf,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut filter = IacFilter::new();
    let mut buf = BytesMut::with_capacity(4096);
    let mut consecutive_errors: u32 = 0;

    loop {
        buf.clear();
        let read = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return;
                }
                continue;
            }
            r = timeout(READ_DEADLINE, read_half.read_buf(&mut buf)) => r,
        };

        match read {
            // Read deadline: not an error, but give up on long-idle links
            Err(_) => {
                if state.idle_for() > IDLE_LIMIT {
                    tracing::info!(session_id = %state.session_id, "telnet idle limit reached");
                    return;
                }
            }
            Ok(Ok(0)) => {
                tracing::info!(session_id = %state.session_id, "telnet remote closed (EOF)");
                return;
            }
            Ok(Ok(_n)) => {
                consecutive_errors = 0;
                state.touch();
                let dims = registry.dims_of(&state.session_id).unwrap_or_default();
                let filtered = filter.feed(&buf, dims);

                if !filtered.replies.is_empty() {
                    let mut guard = state.writer.lock().await;
                    if let Some(w) = guard.as_mut() {
                        let _ = timeout(WRITE_TIMEOUT, w.write_all(&filtered.replies)).await;
                    }
                }

                for event in &filtered.events {
                    let IacEvent::EchoChanged { server_echo } = *event;
                    state.server_echo.store(server_echo, Ordering::Relaxed);
                    let sink = sink.clone();
                    let sid = state.session_id.clone();
                    let content = if server_echo { "echo:server" } else { "echo:local" };
                    // Detached so a slow callback never stalls the reader
                    tokio::spawn(async move {
                        let _ = sink.send(&sid, Message::input_control(content)).await;
                    });
                }

                if !filtered.payload.is_empty() {
                    let content = String::from_utf8_lossy(&filtered.payload).into_owned();
                    let msg = Message::telnet(content);

                    let sink = sink.clone();
                    let sid = state.session_id.clone();
                    let fire = msg.clone();
                    tokio::spawn(async move {
                        let _ = sink.send(&sid, fire).await;
                    });

                    state.channel_send(msg).await;
                }
            }
            Ok(Err(e)) => {
                consecutive_errors += 1;
                tracing::warn!(
                    session_id = %state.session_id,
                    error = %e,
                    consecutive_errors,
                    "telnet read error"
                );
                if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    return;
                }
            }
        }
    }
}
