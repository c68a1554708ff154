//! Session multiplexer: one subprocess + PTY shared by many WebSocket clients.
//! Owns the client registry, the effective PTY size (element-wise minimum of
//! client sizes), the virtual terminal + scrollback ring used for late-joiner
//! catch-up, the recording triple, the startup input gate, and the
//! exit/restart state machine driven by the output pump.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::assistant::AssistantKind;
use crate::protocol::{validate_session_name, ServerMessage};
use crate::pty::{self, PtyProcess};
use crate::recording::{RecordingMeta, RecordingWriter};
use crate::ring::RingBuffer;
use crate::term::VirtualTerminal;

/// Effective PTY size when no client is registered.
pub const DEFAULT_ROWS: u16 = 24;
pub const DEFAULT_COLS: u16 = 80;

/// Pause before respawning a crashed subprocess.
const RESTART_DELAY: Duration = Duration::from_millis(500);

/// Unique session identifier (UUID v4, supplied by the client in the WS URL).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    /// First UUID group, used in status messages and logs.
    pub fn short(&self) -> String {
        self.0.to_string().chars().take(8).collect()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Terminal state of a session. Transitions are driven solely by the output
/// pump; detaching clients never terminates a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    Restarting,
    Terminal,
}

impl SessionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Terminal => "terminal",
        }
    }
}

/// One message queued for a client. The per-client writer task drains these
/// in order, which serializes WebSocket writes per connection.
#[derive(Debug, Clone)]
pub enum Outbound {
    Binary(Bytes),
    Text(String),
    /// Raw catch-up payload (scrollback or snapshot). Queued uncompressed so
    /// the session lock is never held across gzip; the writer task compresses
    /// and frames it off the reactor, and channel order keeps it ahead of any
    /// later live bytes.
    CatchUp(Bytes),
}

pub type ClientId = u64;
pub type ClientSender = mpsc::UnboundedSender<Outbound>;

struct ClientHandle {
    tx: ClientSender,
    rows: u16,
    cols: u16,
    addr: String,
}

/// Virtual terminal + scrollback ring, updated together under one mutex so
/// snapshots and ring copies are mutually consistent.
struct Screen {
    term: VirtualTerminal,
    ring: RingBuffer,
}

struct SessionInner {
    clients: HashMap<ClientId, ClientHandle>,
    next_client: ClientId,
    /// Effective PTY size (rows, cols): element-wise minimum over clients.
    effective: (u16, u16),
    pty: Option<PtyProcess>,
    state: SessionState,
    meta: RecordingMeta,
    /// While set and in the future, client input is buffered, not forwarded.
    gate_deadline: Option<Instant>,
    pending_input: Vec<Vec<u8>>,
}

/// Per-session knobs, taken from [`crate::config::Config`] by the server and
/// passed explicitly so sessions are testable without global state.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub recordings_dir: PathBuf,
    pub motd: Option<String>,
    pub input_grace: Duration,
    pub scrollback_bytes: usize,
}

pub struct Session {
    pub id: SessionId,
    /// Stable across subprocess restarts; keys the recording triple.
    pub recording_id: uuid::Uuid,
    pub assistant: AssistantKind,
    pub work_dir: PathBuf,
    pub created_at: chrono::DateTime<chrono::Utc>,
    motd: Option<String>,
    input_grace: Duration,
    inner: Mutex<SessionInner>,
    screen: Mutex<Screen>,
    recorder: Mutex<Option<RecordingWriter>>,
    last_activity: Mutex<Instant>,
}

/// Global registry of live sessions.
pub type Registry = Arc<DashMap<SessionId, Arc<Session>>>;

pub fn new_registry() -> Registry {
    Arc::new(DashMap::new())
}

impl Session {
    /// Create the session aggregate and its recording triple. The subprocess
    /// is not spawned until the first client attaches.
    pub fn new(
        id: SessionId,
        assistant: AssistantKind,
        work_dir: PathBuf,
        name: Option<String>,
        opts: SessionOptions,
    ) -> Arc<Self> {
        let recording_id = uuid::Uuid::new_v4();
        let mut meta = RecordingMeta::new(
            recording_id,
            assistant.as_str(),
            assistant.start_command(),
            &work_dir,
        );
        meta.name = name.as_deref().and_then(validate_session_name);

        let recorder = match RecordingWriter::create(&opts.recordings_dir, recording_id) {
            Ok(writer) => {
                if let Err(e) = writer.write_meta(&meta) {
                    warn!("session {}: initial metadata write failed: {}", id.short(), e);
                }
                Some(writer)
            }
            Err(e) => {
                warn!("session {}: recording disabled: {}", id.short(), e);
                None
            }
        };

        info!(
            "session {} created (assistant={}, dir={})",
            id.short(),
            assistant.as_str(),
            work_dir.display()
        );

        Arc::new(Self {
            id,
            recording_id,
            assistant,
            work_dir,
            created_at: chrono::Utc::now(),
            motd: opts.motd,
            input_grace: opts.input_grace,
            inner: Mutex::new(SessionInner {
                clients: HashMap::new(),
                next_client: 0,
                effective: (DEFAULT_ROWS, DEFAULT_COLS),
                pty: None,
                state: SessionState::Starting,
                meta,
                gate_deadline: None,
                pending_input: Vec::new(),
            }),
            screen: Mutex::new(Screen {
                term: VirtualTerminal::new(DEFAULT_ROWS, DEFAULT_COLS),
                ring: RingBuffer::new(opts.scrollback_bytes),
            }),
            recorder: Mutex::new(recorder),
            last_activity: Mutex::new(Instant::now()),
        })
    }

    /// Register a client. The first client spawns the subprocess and the
    /// output pump; later clients get scrollback + snapshot catch-up queued
    /// ahead of any further live output.
    pub fn attach(
        self: &Arc<Self>,
        tx: ClientSender,
        rows: u16,
        cols: u16,
        addr: String,
    ) -> anyhow::Result<ClientId> {
        let (client_id, first, meta);
        {
            let mut inner = self.inner.lock().expect("session mutex");
            if inner.state == SessionState::Terminal {
                anyhow::bail!("session has terminated");
            }
            client_id = inner.next_client;
            inner.next_client += 1;
            inner.clients.insert(
                client_id,
                ClientHandle {
                    tx: tx.clone(),
                    rows,
                    cols,
                    addr: addr.clone(),
                },
            );
            inner.meta.note_visitor(&addr);
            self.reconcile_size_locked(&mut inner);
            first = inner.state == SessionState::Starting && inner.clients.len() == 1;

            if !first {
                // Catch-up is queued while the session lock is held, under the
                // same lock sequence the pump broadcasts with, so the client
                // sees exactly scrollback + snapshot + live with no gap or
                // duplicate. Only the ring/screen copies happen here; the
                // writer task compresses them outside any lock.
                let (scrollback, snapshot) = {
                    let screen = self.screen.lock().expect("screen mutex");
                    (screen.ring.read(), screen.term.snapshot())
                };
                if !scrollback.is_empty() {
                    let _ = tx.send(Outbound::CatchUp(Bytes::from(scrollback)));
                }
                let _ = tx.send(Outbound::CatchUp(Bytes::from(snapshot)));
            }
            meta = inner.meta.clone();
        }
        self.persist_meta(&meta);

        if first {
            if let Err(e) = self.start_first_client(&tx) {
                self.detach(client_id);
                return Err(e);
            }
        }
        info!("session {}: client {} attached ({})", self.id.short(), client_id, addr);
        self.broadcast_status();
        Ok(client_id)
    }

    /// MOTD + input gate + subprocess spawn + pump start, for the first
    /// client of a fresh session.
    fn start_first_client(self: &Arc<Self>, tx: &ClientSender) -> anyhow::Result<()> {
        if let Some(motd) = self.motd.clone() {
            // Visible before the subprocess produces output; written to the
            // emulator and ring (so snapshots include it) and to this client,
            // but never to the PTY.
            let bytes = motd.into_bytes();
            let _inner = self.inner.lock().expect("session mutex");
            {
                let mut screen = self.screen.lock().expect("screen mutex");
                screen.term.process(&bytes);
                screen.ring.append(&bytes);
            }
            let _ = tx.send(Outbound::Binary(Bytes::from(bytes)));
        }

        let deadline = Instant::now() + self.input_grace;
        {
            let mut inner = self.inner.lock().expect("session mutex");
            inner.gate_deadline = Some(deadline);
        }
        let gate_session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await;
            gate_session.flush_gate();
        });

        let argv = self.assistant.start_command();
        let (rows, cols) = self.effective_size();
        let (process, rx) = match pty::spawn(&argv, &self.work_dir, rows, cols) {
            Ok(pair) => pair,
            Err(e) => {
                let notice = format!("\r\n[Failed to start process: {}]\r\n", e);
                self.pump_bytes(notice.as_bytes());
                self.finish();
                return Err(e);
            }
        };
        {
            let mut inner = self.inner.lock().expect("session mutex");
            inner.pty = Some(process);
            inner.state = SessionState::Running;
        }
        tokio::spawn(Arc::clone(self).run_pump(rx));
        Ok(())
    }

    /// Remove a client. Never stops the subprocess; may shrink-to-default the
    /// effective PTY size.
    pub fn detach(&self, client_id: ClientId) {
        let (addr, any_left, peaks_changed, meta);
        {
            let mut inner = self.inner.lock().expect("session mutex");
            let Some(handle) = inner.clients.remove(&client_id) else {
                return;
            };
            addr = handle.addr;
            peaks_changed = self.reconcile_size_locked(&mut inner);
            any_left = !inner.clients.is_empty();
            meta = inner.meta.clone();
        }
        if peaks_changed {
            self.persist_meta(&meta);
        }
        debug!(
            "session {}: client {} detached ({})",
            self.id.short(),
            client_id,
            addr
        );
        if any_left {
            self.broadcast_status();
        }
    }

    /// Forward client bytes to the subprocess, honoring the startup gate:
    /// before the deadline every write is copied into the pending queue, and
    /// the queue is flushed in order before the first post-deadline write.
    pub fn write_input(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().expect("session mutex");
        if inner.state == SessionState::Terminal {
            return;
        }
        if let Some(deadline) = inner.gate_deadline {
            if Instant::now() < deadline {
                inner.pending_input.push(bytes.to_vec());
                return;
            }
            inner.gate_deadline = None;
            let pending: Vec<Vec<u8>> = inner.pending_input.drain(..).collect();
            write_all_to_pty(&inner, &pending, &self.id);
        }
        let owned = bytes.to_vec();
        write_all_to_pty(&inner, std::slice::from_ref(&owned), &self.id);
        drop(inner);
        self.touch();
    }

    /// Flush the gate once its deadline passed; the timer task calls this so
    /// buffered input is not stuck waiting for the next keystroke.
    pub fn flush_gate(&self) {
        let mut inner = self.inner.lock().expect("session mutex");
        let Some(deadline) = inner.gate_deadline else {
            return;
        };
        if Instant::now() < deadline {
            return;
        }
        inner.gate_deadline = None;
        let pending: Vec<Vec<u8>> = inner.pending_input.drain(..).collect();
        if !pending.is_empty() {
            debug!(
                "session {}: gate flushed {} buffered writes",
                self.id.short(),
                pending.len()
            );
        }
        write_all_to_pty(&inner, &pending, &self.id);
    }

    /// Update one client's declared size and reconcile the effective minimum.
    pub fn resize(&self, client_id: ClientId, rows: u16, cols: u16) {
        let (peaks_changed, meta);
        {
            let mut inner = self.inner.lock().expect("session mutex");
            let Some(client) = inner.clients.get_mut(&client_id) else {
                return;
            };
            client.rows = rows;
            client.cols = cols;
            peaks_changed = self.reconcile_size_locked(&mut inner);
            meta = inner.meta.clone();
        }
        if peaks_changed {
            self.persist_meta(&meta);
        }
        self.broadcast_status();
    }

    /// Rename the session after validation; invalid names are silently
    /// ignored (no broadcast). Returns whether the rename applied.
    pub fn rename(&self, raw: &str) -> bool {
        let Some(name) = validate_session_name(raw) else {
            return false;
        };
        let meta = {
            let mut inner = self.inner.lock().expect("session mutex");
            inner.meta.name = Some(name);
            inner.meta.clone()
        };
        self.persist_meta(&meta);
        self.broadcast_status();
        true
    }

    /// Fan a chat line out to every client.
    pub fn broadcast_chat(&self, user_name: &str, text: &str) {
        let msg = ServerMessage::Chat {
            user_name: user_name.to_string(),
            text: text.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        self.broadcast_text(&msg.to_json());
    }

    /// Current session status to every client. Best-effort and out-of-band
    /// with respect to PTY bytes.
    pub fn broadcast_status(&self) {
        let inner = self.inner.lock().expect("session mutex");
        let msg = ServerMessage::Status {
            viewers: inner.clients.len(),
            rows: inner.effective.0,
            cols: inner.effective.1,
            assistant: self.assistant.as_str().to_string(),
            session_name: inner.meta.name.clone().unwrap_or_default(),
            uuid_short: self.id.short(),
            work_dir: self.work_dir.to_string_lossy().into_owned(),
        };
        let json = msg.to_json();
        for client in inner.clients.values() {
            let _ = client.tx.send(Outbound::Text(json.clone()));
        }
    }

    pub fn broadcast_exit(&self, exit_code: i32) {
        let msg = ServerMessage::Exit {
            exit_code,
            worktree: None,
        };
        self.broadcast_text(&msg.to_json());
    }

    fn broadcast_text(&self, json: &str) {
        let inner = self.inner.lock().expect("session mutex");
        for client in inner.clients.values() {
            let _ = client.tx.send(Outbound::Text(json.to_string()));
        }
    }

    /// Feed bytes through emulator + ring, then queue them to every client.
    /// Used for PTY output and for server-generated notices; holds the
    /// session lock across the queueing so catch-up ordering holds (see
    /// `attach`).
    fn pump_bytes(&self, bytes: &[u8]) {
        let inner = self.inner.lock().expect("session mutex");
        {
            let mut screen = self.screen.lock().expect("screen mutex");
            screen.term.process(bytes);
            screen.ring.append(bytes);
        }
        let payload = Bytes::copy_from_slice(bytes);
        for client in inner.clients.values() {
            let _ = client.tx.send(Outbound::Binary(payload.clone()));
        }
    }

    fn record_chunk(&self, delay: Duration, bytes: &[u8]) {
        let mut recorder = self.recorder.lock().expect("recorder mutex");
        if let Some(writer) = recorder.as_mut() {
            if let Err(e) = writer.append(delay, bytes) {
                warn!("session {}: recording write failed: {}", self.id.short(), e);
            }
        }
    }

    fn persist_meta(&self, meta: &RecordingMeta) {
        let recorder = self.recorder.lock().expect("recorder mutex");
        if let Some(writer) = recorder.as_ref() {
            if let Err(e) = writer.write_meta(meta) {
                warn!("session {}: metadata write failed: {}", self.id.short(), e);
            }
        }
    }

    /// Recompute the effective size; apply to PTY and emulator when changed.
    /// Returns whether the metadata size peaks changed (caller persists).
    fn reconcile_size_locked(&self, inner: &mut SessionInner) -> bool {
        let size = min_size(inner.clients.values().map(|c| (c.rows, c.cols)));
        if size != inner.effective {
            inner.effective = size;
            if let Some(pty) = &inner.pty {
                pty.resize(size.0, size.1);
            }
            let mut screen = self.screen.lock().expect("screen mutex");
            screen.term.set_size(size.0, size.1);
        }
        inner.meta.note_size(size.0, size.1)
    }

    /// Mark the session Terminal and persist the final metadata.
    fn finish(&self) {
        let meta = {
            let mut inner = self.inner.lock().expect("session mutex");
            inner.state = SessionState::Terminal;
            inner.meta.ended_at = Some(chrono::Utc::now().to_rfc3339());
            inner.meta.clone()
        };
        self.persist_meta(&meta);
        info!("session {} terminated", self.id.short());
    }

    /// Output pump: drain PTY output generations, driving the exit/restart
    /// state machine when a generation's stream ends. Sole owner of
    /// subprocess lifecycle decisions.
    pub async fn run_pump(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>) {
        let mut last_read = Instant::now();
        loop {
            while let Some(bytes) = rx.recv().await {
                let delay = last_read.elapsed();
                last_read = Instant::now();
                self.pump_bytes(&bytes);
                self.record_chunk(delay, &bytes);
                self.touch();
            }

            // Stream ended: reap the subprocess (kill first if a transient
            // PTY failure left it alive) and recover the exit code.
            let process = self.inner.lock().expect("session mutex").pty.take();
            let exit_code = match process {
                Some(p) => tokio::task::spawn_blocking(move || p.shutdown())
                    .await
                    .unwrap_or(0),
                None => 0,
            };

            let has_clients = !self.inner.lock().expect("session mutex").clients.is_empty();
            if !has_clients {
                self.finish();
                return;
            }

            if exit_code == 0 {
                self.pump_bytes(b"\r\n[Process exited successfully]\r\n");
                self.broadcast_exit(0);
                self.finish();
                return;
            }

            let notice = format!(
                "\r\n[Process exited with code {}, restarting...]\r\n",
                exit_code
            );
            self.pump_bytes(notice.as_bytes());
            self.inner.lock().expect("session mutex").state = SessionState::Restarting;
            info!(
                "session {}: subprocess exited with {}, restarting",
                self.id.short(),
                exit_code
            );
            tokio::time::sleep(RESTART_DELAY).await;

            let argv = self.assistant.resume_command();
            let (rows, cols) = self.effective_size();
            match pty::spawn(&argv, &self.work_dir, rows, cols) {
                Ok((process, new_rx)) => {
                    let mut inner = self.inner.lock().expect("session mutex");
                    inner.pty = Some(process);
                    inner.state = SessionState::Running;
                    drop(inner);
                    rx = new_rx;
                    last_read = Instant::now();
                }
                Err(e) => {
                    let notice = format!("\r\n[Failed to restart process: {}]\r\n", e);
                    self.pump_bytes(notice.as_bytes());
                    self.broadcast_exit(exit_code);
                    self.finish();
                    return;
                }
            }
        }
    }

    fn touch(&self) {
        *self.last_activity.lock().expect("activity mutex") = Instant::now();
    }

    pub fn effective_size(&self) -> (u16, u16) {
        self.inner.lock().expect("session mutex").effective
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().expect("session mutex").state
    }

    pub fn is_terminal(&self) -> bool {
        self.state() == SessionState::Terminal
    }

    pub fn viewers(&self) -> usize {
        self.inner.lock().expect("session mutex").clients.len()
    }

    pub fn name(&self) -> Option<String> {
        self.inner.lock().expect("session mutex").meta.name.clone()
    }

    pub fn idle_secs(&self) -> u64 {
        self.last_activity
            .lock()
            .expect("activity mutex")
            .elapsed()
            .as_secs()
    }
}

/// Element-wise minimum of client sizes; (24, 80) when empty, clamped to ≥1.
fn min_size(sizes: impl Iterator<Item = (u16, u16)>) -> (u16, u16) {
    let mut any = false;
    let (mut rows, mut cols) = (u16::MAX, u16::MAX);
    for (r, c) in sizes {
        any = true;
        rows = rows.min(r);
        cols = cols.min(c);
    }
    if !any {
        return (DEFAULT_ROWS, DEFAULT_COLS);
    }
    (rows.max(1), cols.max(1))
}

fn write_all_to_pty(inner: &SessionInner, chunks: &[Vec<u8>], id: &SessionId) {
    let Some(pty) = &inner.pty else {
        return;
    };
    for chunk in chunks {
        if let Err(e) = pty.write(chunk) {
            warn!("session {}: pty write failed: {}", id.short(), e);
            return;
        }
    }
}
