//! Shared connection state.
//!
//! One `ConnectionState` lives for the whole process. Flags are plain atomics
//! (a stale read costs at most one extra loop iteration); socket handles are
//! owned here and only ever closed through the methods below.

use crate::remote::RemoteStream;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::UdpSocket,
    sync::watch,
};
use tokio_util::sync::CancellationToken;

/// Write half of the accepted game socket.
pub type GameWriter = Box<dyn AsyncWrite + Send + Unpin>;

pub const INITIAL_UPLOAD_STATUS: &str = "Ulstart";
pub const INITIAL_MAP_STATUS: &str = " ";
pub const UPLOAD_DONE_STATUS: &str = "Uldone";

/// Client session id before the remote handshake assigns one.
pub const UNASSIGNED_SESSION_ID: i32 = -1;

pub struct ConnectionState {
    relay_active: AtomicBool,
    remote_link_active: AtomicBool,
    game_connected: AtomicBool,
    remote_bringup_pending: watch::Sender<bool>,
    /// Set once the process is exiting; close errors are no longer reported.
    shutting_down: AtomicBool,
    client_session_id: AtomicI32,

    epoch: Instant,
    /// Microseconds since `epoch`, plus one. Zero means no ping is outstanding.
    ping_started_at: AtomicU64,
    last_rtt_millis: AtomicU64,

    upload_status: watch::Sender<String>,
    map_status: watch::Sender<String>,

    /// Cancelled when the local listener is invalidated.
    listener: Mutex<CancellationToken>,
    game: tokio::sync::Mutex<Option<GameWriter>>,
    /// Cancelled when the game socket is closed; unblocks a stuck write.
    game_token: Mutex<CancellationToken>,
    remote_stream: Mutex<Option<Arc<dyn RemoteStream>>>,
    remote_datagram: Mutex<Option<Arc<UdpSocket>>>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            relay_active: AtomicBool::new(true),
            remote_link_active: AtomicBool::new(true),
            game_connected: AtomicBool::new(false),
            remote_bringup_pending: watch::Sender::new(false),
            shutting_down: AtomicBool::new(false),
            client_session_id: AtomicI32::new(UNASSIGNED_SESSION_ID),
            epoch: Instant::now(),
            ping_started_at: AtomicU64::new(0),
            last_rtt_millis: AtomicU64::new(0),
            upload_status: watch::Sender::new(INITIAL_UPLOAD_STATUS.to_owned()),
            map_status: watch::Sender::new(INITIAL_MAP_STATUS.to_owned()),
            listener: Mutex::new(CancellationToken::new()),
            game: tokio::sync::Mutex::new(None),
            game_token: Mutex::new(CancellationToken::new()),
            remote_stream: Mutex::new(None),
            remote_datagram: Mutex::new(None),
        }
    }

    pub fn is_relay_active(&self) -> bool {
        self.relay_active.load(Ordering::SeqCst)
    }

    pub fn set_relay_active(&self, active: bool) {
        self.relay_active.store(active, Ordering::SeqCst);
    }

    pub fn is_remote_link_active(&self) -> bool {
        self.remote_link_active.load(Ordering::SeqCst)
    }

    pub fn set_remote_link_active(&self, active: bool) {
        self.remote_link_active.store(active, Ordering::SeqCst);
    }

    pub fn is_game_connected(&self) -> bool {
        self.game_connected.load(Ordering::SeqCst)
    }

    pub fn set_game_connected(&self, connected: bool) {
        self.game_connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_bringup_pending(&self) -> bool {
        *self.remote_bringup_pending.borrow()
    }

    /// Marks a remote bring-up as spawned.
    pub fn begin_bringup(&self) {
        self.remote_bringup_pending.send_replace(true);
    }

    /// Marks the current remote bring-up as no longer pending,
    /// either because it connected or because it gave up.
    pub fn finish_bringup(&self) {
        self.remote_bringup_pending.send_replace(false);
    }

    /// Watches the reconnection guard flag.
    pub fn subscribe_bringup_pending(&self) -> watch::Receiver<bool> {
        self.remote_bringup_pending.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Flags the process as exiting.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Gets the client session id, or `None` if unassigned.
    pub fn client_session_id(&self) -> Option<i32> {
        match self.client_session_id.load(Ordering::SeqCst) {
            id if id >= 0 => Some(id),
            _ => None,
        }
    }

    /// Assigns the client session id. Returns `false` if one
    /// is already assigned for this remote session (or `id` is negative).
    pub fn assign_session_id(&self, id: i32) -> bool {
        if id < 0 {
            return false;
        }
        self.client_session_id
            .compare_exchange(UNASSIGNED_SESSION_ID, id, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn record_ping_start(&self, at: Instant) {
        let micros = at.saturating_duration_since(self.epoch).as_micros();
        let micros = u64::try_from(micros).unwrap_or(u64::MAX - 1);
        self.ping_started_at.store(micros + 1, Ordering::SeqCst);
    }

    /// Computes the round trip of the outstanding ping as of `now`
    /// and stores it. A ping start after `now` yields 0.
    ///
    /// Returns `None` if no ping was ever sent.
    pub fn complete_ping(&self, now: Instant) -> Option<u64> {
        let started_at = match self.ping_started_at.load(Ordering::SeqCst) {
            0 => return None,
            micros => self.epoch + Duration::from_micros(micros - 1),
        };
        let rtt = now.saturating_duration_since(started_at).as_millis();
        let rtt = u64::try_from(rtt).unwrap_or(u64::MAX);
        self.last_rtt_millis.store(rtt, Ordering::SeqCst);
        Some(rtt)
    }

    pub fn last_rtt_millis(&self) -> u64 {
        self.last_rtt_millis.load(Ordering::SeqCst)
    }

    pub fn upload_status(&self) -> String {
        self.upload_status.borrow().clone()
    }

    pub fn map_status(&self) -> String {
        self.map_status.borrow().clone()
    }

    pub fn subscribe_upload_status(&self) -> watch::Receiver<String> {
        self.upload_status.subscribe()
    }

    pub fn subscribe_map_status(&self) -> watch::Receiver<String> {
        self.map_status.subscribe()
    }

    pub fn set_upload_status(&self, status: impl Into<String>) {
        self.upload_status.send_replace(status.into());
    }

    /// Stores a map status update and marks the upload as done.
    pub fn set_map_status(&self, status: String) {
        self.map_status.send_replace(status);
        self.upload_status.send_replace(UPLOAD_DONE_STATUS.to_owned());
    }

    /// Re-arms the state for a new run of the accept loop.
    /// Returns the token guarding the local listener.
    pub fn rearm(&self) -> CancellationToken {
        self.set_relay_active(true);
        self.set_remote_link_active(true);
        self.finish_bringup();
        self.client_session_id
            .store(UNASSIGNED_SESSION_ID, Ordering::SeqCst);
        let token = CancellationToken::new();
        *lock(&self.listener) = token.clone();
        token
    }

    /// Re-arms the flags for a new remote session after the
    /// previous one has been shut down.
    pub fn begin_remote_session(&self) {
        self.set_relay_active(true);
        self.set_remote_link_active(true);
        self.client_session_id
            .store(UNASSIGNED_SESSION_ID, Ordering::SeqCst);
    }

    pub fn listener_token(&self) -> CancellationToken {
        lock(&self.listener).clone()
    }

    /// Installs the write half of a newly accepted game socket.
    /// `token` is cancelled when the socket is closed.
    pub async fn install_game_writer(&self, writer: GameWriter, token: CancellationToken) {
        let mut game = self.game.lock().await;
        *lock(&self.game_token) = token;
        *game = Some(writer);
    }

    /// Locks the game write half. This is the single lock
    /// that serializes every write to the game.
    pub(crate) async fn lock_game(&self) -> tokio::sync::MutexGuard<'_, Option<GameWriter>> {
        self.game.lock().await
    }

    pub(crate) fn game_token(&self) -> CancellationToken {
        lock(&self.game_token).clone()
    }

    /// Installs the remote stream. This completes the pending bring-up.
    pub fn install_remote_stream(&self, stream: Arc<dyn RemoteStream>) {
        *lock(&self.remote_stream) = Some(stream);
        self.finish_bringup();
    }

    pub fn remote_stream(&self) -> Option<Arc<dyn RemoteStream>> {
        lock(&self.remote_stream).clone()
    }

    pub fn install_remote_datagram(&self, socket: Arc<UdpSocket>) {
        *lock(&self.remote_datagram) = Some(socket);
    }

    pub fn remote_datagram(&self) -> Option<Arc<UdpSocket>> {
        lock(&self.remote_datagram).clone()
    }

    /// Closes the game socket, if open.
    pub async fn close_game(&self) {
        self.game_token().cancel();
        let writer = self.game.lock().await.take();
        if let Some(mut writer) = writer {
            tracing::debug!("Terminating game socket");
            if let Err(e) = writer.shutdown().await {
                self.report_close_error("game", &e);
            }
        }
    }

    /// Closes both remote sockets, if open.
    pub async fn close_remote(&self) {
        let stream = lock(&self.remote_stream).take();
        if let Some(stream) = stream {
            tracing::debug!("Terminating remote stream");
            if let Err(e) = stream.close().await {
                self.report_close_error("remote stream", &e);
            }
        }
        if lock(&self.remote_datagram).take().is_some() {
            tracing::debug!("Terminating remote datagram socket");
        }
    }

    /// Full lifecycle reset: clears the flags and status strings and closes every
    /// open socket, including the local listener. Never fails.
    pub async fn reset(&self) {
        tracing::debug!("Network reset called");
        self.set_remote_link_active(false);
        self.set_relay_active(false);
        self.set_game_connected(false);
        self.upload_status.send_replace(INITIAL_UPLOAD_STATUS.to_owned());
        self.map_status.send_replace(INITIAL_MAP_STATUS.to_owned());

        lock(&self.listener).cancel();
        self.close_game().await;
        self.close_remote().await;
        self.client_session_id
            .store(UNASSIGNED_SESSION_ID, Ordering::SeqCst);
    }

    fn report_close_error(&self, which: &str, e: &std::io::Error) {
        if !self.is_shutting_down() {
            tracing::warn!("Failed to close {which} socket: {e}");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_immutable_once_assigned() {
        let state = ConnectionState::new();
        assert_eq!(state.client_session_id(), None);
        assert!(!state.assign_session_id(-3));
        assert!(state.assign_session_id(2));
        assert!(!state.assign_session_id(5));
        assert_eq!(state.client_session_id(), Some(2));

        state.begin_remote_session();
        assert_eq!(state.client_session_id(), None);
    }

    #[test]
    fn ping_in_the_future_clamps_to_zero() {
        let state = ConnectionState::new();
        assert_eq!(state.complete_ping(Instant::now()), None);

        let now = Instant::now();
        state.record_ping_start(now);
        assert_eq!(state.complete_ping(now + Duration::from_millis(35)), Some(35));
        assert_eq!(state.last_rtt_millis(), 35);

        state.record_ping_start(now + Duration::from_secs(5));
        assert_eq!(state.complete_ping(now), Some(0));
        assert_eq!(state.last_rtt_millis(), 0);
    }

    #[tokio::test]
    async fn reset_is_idempotent_and_restores_statuses() {
        let state = ConnectionState::new();
        let listener = state.rearm();
        state.set_map_status("Mmaps/gridmap.zip".to_owned());
        assert_eq!(state.upload_status(), UPLOAD_DONE_STATUS);

        let (_client, server) = tokio::io::duplex(64);
        state
            .install_game_writer(Box::new(server), CancellationToken::new())
            .await;

        state.reset().await;
        state.reset().await;

        assert!(listener.is_cancelled());
        assert!(!state.is_relay_active());
        assert!(!state.is_remote_link_active());
        assert_eq!(state.upload_status(), INITIAL_UPLOAD_STATUS);
        assert_eq!(state.map_status(), INITIAL_MAP_STATUS);
        assert!(state.lock_game().await.is_none());
        assert!(state.remote_stream().is_none());
    }
}
