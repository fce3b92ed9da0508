//! Host WebSocket server
//!
//! Accepts peers on `0.0.0.0:<port>`, validates their `pair` token, answers
//! with `hello`, then hands every frame to a per-peer [`Multiplexer`].
//! A failing peer only ever ends its own connection.

use crate::config::{Config, TokenPolicy};
use crate::error::{Result, CLOSE_HANDSHAKE_TIMEOUT, CLOSE_PAIRING_REJECTED};
use crate::handlers::{ClipboardHandler, CommandHandler, InputHandler, LoggingInput, SystemClipboard};
use crate::mux::{Channel, ChannelHandler, Dispatch, Multiplexer};
use crate::pairing::{generate_token, lan_ip_or_loopback, PairingInfo, PairingIssuer};
use crate::protocol::{Inbound, Message};
use crate::transfer::{MessageSink, TransferTable};
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Outbound queue of every authenticated peer
pub type PeerMap = Arc<RwLock<HashMap<SocketAddr, mpsc::UnboundedSender<WsMessage>>>>;

/// Everything the host needs to know before binding
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// 0 picks a free port
    pub port: u16,
    pub bind_ip: IpAddr,
    /// Address put into the pairing payload; LAN address when `None`
    pub advertise_ip: Option<IpAddr>,
    /// Fixed pairing token; a random one when `None`
    pub token: Option<String>,
    pub host_type: Option<String>,
    pub token_policy: TokenPolicy,
    pub download_dir: PathBuf,
    pub max_file_size: u64,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
}

impl From<&Config> for HostOptions {
    fn from(config: &Config) -> Self {
        Self {
            port: config.port,
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            advertise_ip: None,
            token: None,
            host_type: config.host_type.clone(),
            token_policy: config.token_policy,
            download_dir: config.download_dir(),
            max_file_size: config.max_file_size,
            handshake_timeout: config.handshake_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            idle_timeout: config.idle_timeout(),
        }
    }
}

/// Clipboard, command and input handlers backed by this machine
pub fn default_handlers(config: &Config) -> Vec<(Channel, Arc<dyn ChannelHandler>)> {
    let clipboard: Arc<dyn ChannelHandler> = Arc::new(ClipboardHandler::new(SystemClipboard));
    let command: Arc<dyn ChannelHandler> = Arc::new(CommandHandler::new(config.command_timeout()));
    let input: Arc<dyn ChannelHandler> = Arc::new(InputHandler::new(LoggingInput));
    vec![
        (Channel::Clipboard, clipboard),
        (Channel::Command, command),
        (Channel::Media, input.clone()),
        (Channel::Presentation, input.clone()),
        (Channel::RemoteInput, input),
    ]
}

struct HostContext {
    issuer: Arc<PairingIssuer>,
    handlers: Vec<(Channel, Arc<dyn ChannelHandler>)>,
    options: HostOptions,
    peers: PeerMap,
}

impl HostContext {
    fn multiplexer(&self) -> Multiplexer {
        let table = TransferTable::new(self.options.download_dir.clone(), self.options.max_file_size);
        self.handlers
            .iter()
            .fold(Multiplexer::new(table), |mux, (channel, handler)| {
                mux.with_handler(*channel, handler.clone())
            })
    }
}

/// Host builder
pub struct Host {
    options: HostOptions,
    handlers: Vec<(Channel, Arc<dyn ChannelHandler>)>,
}

impl Host {
    pub fn new(options: HostOptions) -> Self {
        Self {
            options,
            handlers: Vec::new(),
        }
    }

    pub fn with_handler(mut self, channel: Channel, handler: Arc<dyn ChannelHandler>) -> Self {
        self.handlers.push((channel, handler));
        self
    }

    pub fn with_handlers(mut self, handlers: Vec<(Channel, Arc<dyn ChannelHandler>)>) -> Self {
        self.handlers.extend(handlers);
        self
    }

    /// Bind the listener, issue the pairing identity, start accepting.
    pub async fn start(self) -> Result<HostHandle> {
        let listener = TcpListener::bind(SocketAddr::new(self.options.bind_ip, self.options.port)).await?;
        let local_addr = listener.local_addr()?;

        let info = PairingInfo {
            server_ip: self
                .options
                .advertise_ip
                .unwrap_or_else(lan_ip_or_loopback)
                .to_string(),
            port: local_addr.port(),
            pairing_token: self.options.token.clone().unwrap_or_else(generate_token),
            host_type: self.options.host_type.clone(),
        };
        let issuer = Arc::new(PairingIssuer::new(info, self.options.token_policy));
        let peers: PeerMap = Arc::new(RwLock::new(HashMap::new()));

        let ctx = Arc::new(HostContext {
            issuer: issuer.clone(),
            handlers: self.handlers,
            options: self.options,
            peers: peers.clone(),
        });

        tracing::info!("Host listening on {}", local_addr);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(accept_loop(listener, ctx, shutdown.clone()));

        Ok(HostHandle {
            local_addr,
            issuer,
            peers,
            shutdown,
            task,
        })
    }
}

/// A running host
pub struct HostHandle {
    local_addr: SocketAddr,
    issuer: Arc<PairingIssuer>,
    peers: PeerMap,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl HostHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn pairing(&self) -> PairingInfo {
        self.issuer.current()
    }

    /// New token for new pairings; connected peers stay connected
    pub fn regenerate_token(&self) -> PairingInfo {
        self.issuer.regenerate()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Stop accepting and close every peer
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

async fn accept_loop(listener: TcpListener, ctx: Arc<HostContext>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Host shutting down");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let ctx = ctx.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, ctx, shutdown).await {
                                tracing::debug!("Connection {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("Accept failed: {}", e),
                }
            }
        }
    }
}

/// Peer outbound queue as seen by the multiplexer
struct PeerSink(mpsc::UnboundedSender<WsMessage>);

#[async_trait]
impl MessageSink for PeerSink {
    async fn send_message(&self, msg: &Message) -> bool {
        self.0.send(WsMessage::Text(msg.to_json())).is_ok()
    }
}

/// Wait for the first `pair` frame. Anything else before it is dropped.
async fn await_pair(rx: &mut WsSource, addr: SocketAddr) -> Option<String> {
    while let Some(frame) = rx.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match Inbound::parse(&text) {
                Inbound::Message(Message::Pair { token }) => return Some(token),
                other => tracing::debug!("Dropping pre-auth frame from {}: {:?}", addr, other),
            },
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// Send a close frame and give the peer a moment to answer it
async fn close_with(tx: &mut WsSink, rx: &mut WsSource, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    };
    if tx.send(WsMessage::Close(Some(frame))).await.is_err() {
        return;
    }
    let drain = async { while let Some(Ok(_)) = rx.next().await {} };
    let _ = tokio::time::timeout(Duration::from_secs(1), drain).await;
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<HostContext>,
    shutdown: CancellationToken,
) -> Result<()> {
    let ws = accept_async(stream).await?;
    let (mut tx, mut rx) = ws.split();
    tracing::debug!("Socket opened by {}", addr);

    let offered = match tokio::time::timeout(ctx.options.handshake_timeout, await_pair(&mut rx, addr)).await {
        Err(_) => {
            tracing::info!("{} never sent pair, closing", addr);
            close_with(&mut tx, &mut rx, CLOSE_HANDSHAKE_TIMEOUT, "pairing timeout").await;
            return Ok(());
        }
        Ok(None) => return Ok(()),
        Ok(Some(token)) => token,
    };

    let Some(session_token) = ctx.issuer.redeem(&offered) else {
        tracing::warn!("Rejected pairing attempt from {}", addr);
        close_with(&mut tx, &mut rx, CLOSE_PAIRING_REJECTED, "pairing rejected").await;
        return Ok(());
    };

    let hello = Message::Hello {
        token: session_token,
        msg: "Welcome".to_string(),
    };
    tx.send(WsMessage::Text(hello.to_json())).await?;
    tracing::info!("Device {} paired", addr);

    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
    ctx.peers.write().await.insert(addr, peer_tx.clone());
    let sink = PeerSink(peer_tx);
    let mut mux = ctx.multiplexer();

    let mut idle_check = tokio::time::interval(ctx.options.heartbeat_interval);
    idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    idle_check.tick().await;
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                close_with(&mut tx, &mut rx, 1001, "host shutting down").await;
                break;
            }

            Some(msg) = peer_rx.recv() => {
                if tx.send(msg).await.is_err() {
                    break;
                }
            }

            _ = idle_check.tick() => {
                if last_activity.elapsed() >= ctx.options.idle_timeout {
                    tracing::info!("{} idle for {:?}, closing", addr, ctx.options.idle_timeout);
                    close_with(&mut tx, &mut rx, 1000, "idle").await;
                    break;
                }
            }

            frame = rx.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_activity = Instant::now();
                        if let Dispatch::LegacyEcho(reply) = mux.dispatch(&text, &sink).await {
                            let _ = sink.0.send(WsMessage::Text(reply));
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => last_activity = Instant::now(),
                    Some(Err(e)) => {
                        tracing::debug!("Socket error from {}: {}", addr, e);
                        break;
                    }
                }
            }
        }
    }

    mux.reset();
    ctx.peers.write().await.remove(&addr);
    tracing::info!("Device {} disconnected", addr);
    Ok(())
}
