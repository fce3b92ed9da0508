//! Client transport session
//!
//! Owns the one WebSocket to a paired host. State machine:
//! `Idle -> Connecting -> Open -> Authenticated -> Closed`. `Authenticated`
//! is only reached after the host answers `pair` with `hello`.
//!
//! After an unexpected close the session reconnects with exponential backoff
//! until attempts run out, [`TransportSession::disconnect`] is called or the
//! app is suspended.

use crate::config::{Config, ReconnectConfig};
use crate::error::{LinkError, Result, CLOSE_PAIRING_REJECTED};
use crate::protocol::{Inbound, Message};
use crate::transfer::MessageSink;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Frames waiting for the socket; senders wait once it is full
const OUTBOUND_QUEUE: usize = 16;

/// Unread host messages kept before the oldest are dropped
const INBOUND_BACKLOG: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    /// Socket is up, `pair` sent, waiting for `hello`
    Open,
    Authenticated,
    Closed,
}

/// Reconnection strategy with exponential backoff
#[derive(Debug, Clone)]
pub struct ReconnectStrategy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
    attempt: u32,
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self::new(&ReconnectConfig::default())
    }
}

impl ReconnectStrategy {
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            max_attempts: config.max_attempts,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u64.saturating_pow(self.attempt);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        self.attempt += 1;
        Some(Duration::from_millis(delay))
    }

    /// Get current attempt count
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// Timing knobs for a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub reconnect: ReconnectConfig,
    pub auto_reconnect: bool,
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            idle_timeout: config.idle_timeout(),
            reconnect: config.reconnect.clone(),
            auto_reconnect: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

#[derive(Debug, Clone)]
struct Target {
    ip: String,
    port: u16,
    token: String,
}

impl Target {
    fn addr(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

/// Why the socket pump stopped
enum PumpExit {
    Cancelled,
    Rejected,
    Lost(String),
}

struct Inner {
    /// Bumped on every connect/disconnect; stale drivers can't touch state
    epoch: u64,
    cancel: CancellationToken,
    outbound: Option<mpsc::Sender<WsMessage>>,
    token: Option<String>,
    status: String,
}

struct Shared {
    config: SessionConfig,
    state_tx: watch::Sender<SessionState>,
    inbound_tx: broadcast::Sender<Message>,
    suspended: AtomicBool,
    inner: Mutex<Inner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Tear down whatever is running and start a new epoch
    fn begin(&self) -> (u64, CancellationToken) {
        let mut inner = self.lock();
        inner.cancel.cancel();
        inner.epoch += 1;
        inner.cancel = CancellationToken::new();
        inner.outbound = None;
        (inner.epoch, inner.cancel.clone())
    }

    fn set_state(&self, epoch: u64, state: SessionState, status: &str) {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return;
        }
        inner.status = status.to_string();
        self.state_tx.send_replace(state);
    }

    fn attach(&self, epoch: u64, outbound: mpsc::Sender<WsMessage>, token: String) -> bool {
        let mut inner = self.lock();
        if inner.epoch != epoch || inner.cancel.is_cancelled() {
            return false;
        }
        inner.outbound = Some(outbound);
        inner.token = Some(token);
        inner.status = "Connected".to_string();
        self.state_tx.send_replace(SessionState::Authenticated);
        true
    }

    fn detach(&self, epoch: u64, status: &str) {
        let mut inner = self.lock();
        if inner.epoch != epoch {
            return;
        }
        inner.outbound = None;
        inner.status = status.to_string();
        self.state_tx.send_replace(SessionState::Closed);
    }

    /// Open the socket, send `pair`, wait for `hello`.
    ///
    /// Returns the socket and the token the host wants us to use from now on.
    async fn establish(&self, target: &Target, epoch: u64, cancel: &CancellationToken) -> Result<(WsStream, String)> {
        let addr = target.addr();
        let url = format!("ws://{}", addr);
        self.set_state(epoch, SessionState::Connecting, "Connecting");
        tracing::debug!("Connecting to {}", url);

        let connect = tokio::time::timeout(self.config.handshake_timeout, connect_async(url));
        let mut ws = tokio::select! {
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            result = connect => match result {
                Err(_) => return Err(LinkError::HandshakeTimeout(addr)),
                Ok(Err(e)) => return Err(LinkError::Connect { addr, reason: e.to_string() }),
                Ok(Ok((ws, _))) => ws,
            },
        };

        self.set_state(epoch, SessionState::Open, "Pairing");
        let pair = Message::Pair {
            token: target.token.clone(),
        };
        ws.send(WsMessage::Text(pair.to_json())).await?;

        let deadline = Instant::now() + self.config.handshake_timeout;
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Err(LinkError::Cancelled),
                frame = tokio::time::timeout_at(deadline, ws.next()) => frame,
            };

            match frame {
                Err(_) => return Err(LinkError::HandshakeTimeout(addr)),
                Ok(Some(Ok(WsMessage::Text(text)))) => match Inbound::parse(&text) {
                    Inbound::Message(Message::Hello { token, msg }) => {
                        tracing::info!("Paired with {}: {}", addr, msg);
                        let token = if token.is_empty() {
                            target.token.clone()
                        } else {
                            token
                        };
                        return Ok((ws, token));
                    }
                    other => tracing::debug!("Ignoring pre-auth frame from {}: {:?}", addr, other),
                },
                Ok(Some(Ok(WsMessage::Close(frame)))) => {
                    return Err(match frame {
                        Some(f) if u16::from(f.code) == CLOSE_PAIRING_REJECTED => LinkError::PairingRejected,
                        _ => LinkError::Closed,
                    });
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => return Err(LinkError::Closed),
            }
        }
    }
}

/// One logical connection to a host.
///
/// All methods take `&self`; share it behind an `Arc` to reach it from
/// several tasks.
pub struct TransportSession {
    shared: Arc<Shared>,
    inbound_rx: tokio::sync::Mutex<broadcast::Receiver<Message>>,
}

impl TransportSession {
    pub fn new(config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let (inbound_tx, inbound_rx) = broadcast::channel(INBOUND_BACKLOG);
        Self {
            shared: Arc::new(Shared {
                config,
                state_tx,
                inbound_tx,
                suspended: AtomicBool::new(false),
                inner: Mutex::new(Inner {
                    epoch: 0,
                    cancel: CancellationToken::new(),
                    outbound: None,
                    token: None,
                    status: "Not connected".to_string(),
                }),
            }),
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Short human readable status for UIs
    pub fn status(&self) -> String {
        self.shared.lock().status.clone()
    }

    /// Token currently used for this host (may differ from the QR token
    /// when the host hands out per-peer tokens)
    pub fn token(&self) -> Option<String> {
        self.shared.lock().token.clone()
    }

    /// Connect and authenticate. Fails fast: no retry on an explicit connect.
    pub async fn connect(&self, ip: &str, port: u16, token: &str) -> Result<()> {
        let (epoch, cancel) = self.shared.begin();
        let target = Target {
            ip: ip.to_string(),
            port,
            token: token.to_string(),
        };

        let (ws, token) = match self.shared.establish(&target, epoch, &cancel).await {
            Ok(established) => established,
            Err(LinkError::Cancelled) => {
                // no-op unless the cancel came from suspend
                self.shared.detach(epoch, "Disconnected");
                return Err(LinkError::Cancelled);
            }
            Err(e) => {
                tracing::info!("Connect to {} failed: {}", target.addr(), e);
                self.shared.detach(epoch, &e.status_message());
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        if !self.shared.attach(epoch, tx, token.clone()) {
            self.shared.detach(epoch, "Disconnected");
            return Err(LinkError::Cancelled);
        }

        let target = Target { token, ..target };
        tokio::spawn(run_driver(self.shared.clone(), ws, rx, target, epoch, cancel));
        Ok(())
    }

    /// Close with a normal closure code. Never triggers auto-reconnect.
    pub fn disconnect(&self) {
        let mut inner = self.shared.lock();
        inner.cancel.cancel();
        inner.epoch += 1;
        inner.outbound = None;
        inner.status = "Disconnected".to_string();
        if *self.shared.state_tx.borrow() != SessionState::Idle {
            self.shared.state_tx.send_replace(SessionState::Closed);
        }
    }

    /// App went to the background: abandon any reconnection in progress and
    /// don't start new ones until [`resume`](Self::resume).
    pub fn suspend(&self) {
        self.shared.suspended.store(true, Ordering::SeqCst);
        let inner = self.shared.lock();
        if self.shared.state() != SessionState::Authenticated {
            inner.cancel.cancel();
        }
    }

    pub fn resume(&self) {
        self.shared.suspended.store(false, Ordering::SeqCst);
    }

    fn outbound(&self) -> Option<mpsc::Sender<WsMessage>> {
        let inner = self.shared.lock();
        if self.shared.state() != SessionState::Authenticated {
            return None;
        }
        inner.outbound.clone()
    }

    /// Queue a message without waiting. Returns `false` unless the session is
    /// authenticated and the outbound queue has room.
    pub fn send(&self, msg: &Message) -> bool {
        match self.outbound() {
            Some(tx) => tx.try_send(WsMessage::Text(msg.to_json())).is_ok(),
            None => false,
        }
    }

    /// Queue a message, waiting for room while the socket drains.
    ///
    /// Returns `false` unless the session is authenticated, or when the
    /// connection drops while waiting.
    pub async fn send_async(&self, msg: &Message) -> bool {
        match self.outbound() {
            Some(tx) => tx.send(WsMessage::Text(msg.to_json())).await.is_ok(),
            None => false,
        }
    }

    /// Next message from the host. When nobody reads for a while the oldest
    /// unread messages are dropped.
    pub async fn recv(&self) -> Option<Message> {
        let mut rx = self.inbound_rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(msg) => return Some(msg),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Dropped {} unread message(s) from host", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Wait until the session reaches `target` or `timeout` elapses
    pub async fn wait_for_state(&self, target: SessionState, timeout: Duration) -> bool {
        let mut rx = self.watch_state();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == target {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }
}

#[async_trait]
impl MessageSink for TransportSession {
    async fn send_message(&self, msg: &Message) -> bool {
        self.send_async(msg).await
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.shared.lock().cancel.cancel();
    }
}

/// Owns the socket for one epoch, reconnecting after unexpected closes.
async fn run_driver(
    shared: Arc<Shared>,
    mut ws: WsStream,
    mut outbound_rx: mpsc::Receiver<WsMessage>,
    mut target: Target,
    epoch: u64,
    cancel: CancellationToken,
) {
    loop {
        // the queue goes down with the socket so waiting senders fail fast
        match pump(&shared, ws, outbound_rx, &cancel).await {
            PumpExit::Cancelled => {
                shared.detach(epoch, "Disconnected");
                return;
            }
            PumpExit::Rejected => {
                tracing::warn!("Host {} rejected our token", target.addr());
                shared.detach(epoch, "Pairing rejected");
                return;
            }
            PumpExit::Lost(reason) => {
                tracing::info!("Connection to {} lost: {}", target.addr(), reason);
                shared.detach(epoch, "Disconnected");
            }
        }

        if !shared.config.auto_reconnect {
            return;
        }

        let Some((new_ws, token)) = reconnect(&shared, &target, epoch, &cancel).await else {
            return;
        };

        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        if !shared.attach(epoch, tx, token.clone()) {
            shared.detach(epoch, "Disconnected");
            return;
        }
        target.token = token;
        ws = new_ws;
        outbound_rx = rx;
    }
}

async fn reconnect(
    shared: &Shared,
    target: &Target,
    epoch: u64,
    cancel: &CancellationToken,
) -> Option<(WsStream, String)> {
    let mut strategy = ReconnectStrategy::new(&shared.config.reconnect);

    while let Some(delay) = strategy.next_delay() {
        if shared.suspended.load(Ordering::SeqCst) {
            tracing::debug!("Suspended, not reconnecting");
            return None;
        }
        tracing::info!(
            "Reconnecting to {} in {:?} (attempt {})",
            target.addr(),
            delay,
            strategy.attempts()
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                shared.detach(epoch, "Disconnected");
                return None;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        match shared.establish(target, epoch, cancel).await {
            Ok(established) => return Some(established),
            Err(LinkError::Cancelled) => {
                shared.detach(epoch, "Disconnected");
                return None;
            }
            Err(LinkError::PairingRejected) => {
                shared.detach(epoch, "Pairing rejected");
                return None;
            }
            Err(e) => {
                tracing::debug!("Reconnect attempt {} failed: {}", strategy.attempts(), e);
                shared.detach(epoch, &e.status_message());
            }
        }
    }

    tracing::info!("Giving up on {} after {} attempts", target.addr(), strategy.attempts());
    None
}

/// Move frames between the socket and the session until something ends it.
async fn pump(
    shared: &Shared,
    ws: WsStream,
    mut outbound_rx: mpsc::Receiver<WsMessage>,
    cancel: &CancellationToken,
) -> PumpExit {
    let (mut tx, mut rx) = ws.split();

    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let close = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                };
                let _ = tx.send(WsMessage::Close(Some(close))).await;
                return PumpExit::Cancelled;
            }

            Some(msg) = outbound_rx.recv() => {
                // a peer that stops reading blocks the write; stay cancellable
                let written = tokio::select! {
                    _ = cancel.cancelled() => return PumpExit::Cancelled,
                    written = tx.send(msg) => written,
                };
                if let Err(e) = written {
                    return PumpExit::Lost(e.to_string());
                }
            }

            _ = heartbeat.tick() => {
                if last_activity.elapsed() >= shared.config.idle_timeout {
                    let _ = tx.close().await;
                    return PumpExit::Lost("no activity".to_string());
                }
                if let Err(e) = tx.send(WsMessage::Text(Message::Ping.to_json())).await {
                    return PumpExit::Lost(e.to_string());
                }
            }

            frame = rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_activity = Instant::now();
                        match Inbound::parse(&text) {
                            Inbound::Message(Message::Pong) => {}
                            Inbound::Message(Message::Ping) => {
                                let _ = tx.send(WsMessage::Text(Message::Pong.to_json())).await;
                            }
                            Inbound::Message(msg) => {
                                let _ = shared.inbound_tx.send(msg);
                            }
                            Inbound::Legacy(text) => tracing::debug!("Legacy text from host: {}", text),
                            Inbound::Unknown(kind) => tracing::debug!("Dropping unknown message type {}", kind),
                            Inbound::Malformed { kind, reason } => {
                                tracing::warn!("Malformed {} from host: {}", kind, reason)
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        return match frame {
                            Some(f) if u16::from(f.code) == CLOSE_PAIRING_REJECTED => PumpExit::Rejected,
                            Some(f) => PumpExit::Lost(format!("closed by host ({})", f.code)),
                            None => PumpExit::Lost("closed by host".to_string()),
                        };
                    }
                    Some(Ok(_)) => last_activity = Instant::now(),
                    Some(Err(e)) => return PumpExit::Lost(e.to_string()),
                    None => return PumpExit::Lost("connection closed".to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut strategy = ReconnectStrategy::new(&ReconnectConfig {
            max_attempts: 6,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
        });
        let delays: Vec<u64> = std::iter::from_fn(|| strategy.next_delay())
            .map(|d| d.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000, 10_000]);
        assert_eq!(strategy.attempts(), 6);
        assert_eq!(strategy.next_delay(), None);
    }

    #[test]
    fn test_send_requires_authentication() {
        let session = TransportSession::new(SessionConfig::default());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.send(&Message::Ping));
    }

    #[tokio::test]
    async fn test_connect_refused_fails_fast() {
        // grab a free port, then close it so nothing is listening
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let session = TransportSession::new(SessionConfig::default());
        let err = session.connect("127.0.0.1", port, "abc").await.unwrap_err();
        assert!(matches!(err, LinkError::Connect { .. }));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.status(), "Unable to reach device");
    }

    #[tokio::test]
    async fn test_suspend_during_connect_closes_session() {
        // accepts TCP but never answers the WebSocket upgrade
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let session = Arc::new(TransportSession::new(SessionConfig::default()));
        let connecting = {
            let session = session.clone();
            tokio::spawn(async move { session.connect("127.0.0.1", port, "abc").await })
        };

        assert!(session.wait_for_state(SessionState::Connecting, Duration::from_secs(2)).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        session.suspend();

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(LinkError::Cancelled)));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.status(), "Disconnected");
        drop(listener);
    }

    #[tokio::test]
    async fn test_silent_host_is_dropped_as_idle() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _pair = ws.next().await;
            let hello = Message::Hello {
                token: "abc".into(),
                msg: "Welcome".into(),
            };
            ws.send(WsMessage::Text(hello.to_json())).await.unwrap();
            // read pings, never answer anything
            while let Some(Ok(_)) = ws.next().await {}
        });

        let session = TransportSession::new(SessionConfig {
            heartbeat_interval: Duration::from_millis(100),
            idle_timeout: Duration::from_millis(300),
            auto_reconnect: false,
            ..SessionConfig::default()
        });
        session.connect("127.0.0.1", port, "abc").await.unwrap();
        assert_eq!(session.state(), SessionState::Authenticated);

        assert!(session.wait_for_state(SessionState::Closed, Duration::from_secs(3)).await);
        assert!(!session.send(&Message::Ping));
    }

    #[tokio::test]
    async fn test_unread_backlog_drops_oldest() {
        let session = TransportSession::new(SessionConfig::default());
        for i in 0..INBOUND_BACKLOG + 5 {
            let msg = Message::CommandOutput {
                output: i.to_string(),
                exit_code: Some(0),
            };
            session.shared.inbound_tx.send(msg).unwrap();
        }

        match session.recv().await {
            Some(Message::CommandOutput { output, .. }) => assert_eq!(output, "5"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_before_connect_stays_idle() {
        let session = TransportSession::new(SessionConfig::default());
        session.disconnect();
        assert_eq!(session.state(), SessionState::Idle);
    }
}
