//! Channel multiplexer
//!
//! Routes every inbound frame of one session to the handler registered for
//! its channel. File transfer frames are handled here against the session's
//! own [`TransferTable`]. Dispatch is serialized by arrival order; nothing is
//! buffered or reordered.

use crate::error::Result;
use crate::protocol::{ClipboardAction, Inbound, Message, Status};
use crate::transfer::{ack_for, MessageSink, TransferTable};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Logical channel a message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Pairing,
    Clipboard,
    Media,
    Presentation,
    Command,
    RemoteInput,
    FileTransfer,
    Heartbeat,
}

impl Channel {
    pub fn of(msg: &Message) -> Self {
        match msg {
            Message::Pair { .. } | Message::Hello { .. } => Channel::Pairing,
            Message::Clipboard { .. }
            | Message::ClipboardRequest { .. }
            | Message::ClipboardResponse { .. } => Channel::Clipboard,
            Message::Media { .. } => Channel::Media,
            Message::Presentation { .. } => Channel::Presentation,
            Message::Command { .. } | Message::CommandOutput { .. } => Channel::Command,
            Message::RemoteInput { .. } => Channel::RemoteInput,
            Message::FileStart { .. }
            | Message::FileChunk { .. }
            | Message::FileEnd { .. }
            | Message::FileAck { .. } => Channel::FileTransfer,
            Message::Ping | Message::Pong => Channel::Heartbeat,
        }
    }
}

/// A logical channel's message handler.
///
/// Returning `Ok(Some(reply))` sends `reply` back on the same session.
/// Errors are logged by the multiplexer and never end the session.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    async fn handle(&self, msg: Message) -> Result<Option<Message>>;
}

/// What happened to one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Handled(Channel),
    /// Plain-text frame; carries the text to send back
    LegacyEcho(String),
    Dropped(String),
}

/// Normalise the deprecated `clipboard` shape into `clipboard_request`.
///
/// A missing action means `set` when data is present and `get` otherwise.
pub fn normalize(msg: Message) -> Message {
    match msg {
        Message::Clipboard { action, data } => {
            let action = action.unwrap_or(if data.is_some() {
                ClipboardAction::Set
            } else {
                ClipboardAction::Get
            });
            Message::ClipboardRequest { action, data }
        }
        other => other,
    }
}

/// Per-session dispatcher
pub struct Multiplexer {
    handlers: HashMap<Channel, Arc<dyn ChannelHandler>>,
    transfers: TransferTable,
}

impl Multiplexer {
    pub fn new(transfers: TransferTable) -> Self {
        Self {
            handlers: HashMap::new(),
            transfers,
        }
    }

    pub fn register(&mut self, channel: Channel, handler: Arc<dyn ChannelHandler>) {
        if self.handlers.insert(channel, handler).is_some() {
            tracing::debug!("Replaced handler for {:?}", channel);
        }
    }

    pub fn with_handler(mut self, channel: Channel, handler: Arc<dyn ChannelHandler>) -> Self {
        self.register(channel, handler);
        self
    }

    /// Peer went away: partial uploads are discarded
    pub fn reset(&mut self) {
        self.transfers.clear();
    }

    /// Decode and route one raw text frame. Never fails.
    pub async fn dispatch(&mut self, raw: &str, sink: &dyn MessageSink) -> Dispatch {
        match Inbound::parse(raw) {
            Inbound::Message(msg) => self.route(msg, sink).await,
            Inbound::Legacy(text) => {
                tracing::debug!("Legacy text frame: {}", text);
                Dispatch::LegacyEcho(format!("Echo: {}", text))
            }
            Inbound::Unknown(kind) => {
                tracing::info!("Dropping message with unknown type '{}'", kind);
                Dispatch::Dropped(format!("unknown type {}", kind))
            }
            Inbound::Malformed { kind, reason } => {
                tracing::warn!("Dropping malformed '{}' message: {}", kind, reason);
                Dispatch::Dropped(format!("malformed {}", kind))
            }
        }
    }

    /// Route an already decoded message
    pub async fn route(&mut self, msg: Message, sink: &dyn MessageSink) -> Dispatch {
        let msg = normalize(msg);
        let channel = Channel::of(&msg);

        match channel {
            Channel::Heartbeat => {
                if msg == Message::Ping {
                    sink.send_message(&Message::Pong).await;
                }
                return Dispatch::Handled(channel);
            }
            Channel::FileTransfer => {
                self.handle_transfer(msg, sink).await;
                return Dispatch::Handled(channel);
            }
            _ => {}
        }

        let Some(handler) = self.handlers.get(&channel).cloned() else {
            tracing::debug!("No handler for {}", msg.kind());
            return Dispatch::Dropped(format!("no handler for {}", msg.kind()));
        };

        let kind = msg.kind();
        match handler.handle(msg).await {
            Ok(Some(reply)) => {
                if !sink.send_message(&reply).await {
                    tracing::debug!("Reply to {} not sent, session gone", kind);
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Handler for {} failed: {}", kind, e),
        }
        Dispatch::Handled(channel)
    }

    async fn handle_transfer(&mut self, msg: Message, sink: &dyn MessageSink) {
        match msg {
            Message::FileStart {
                file_id,
                name,
                size,
                mime,
            } => {
                if let Err(e) = self.transfers.start(&file_id, &name, size, &mime) {
                    tracing::warn!("Refusing {}: {}", name, e);
                    sink.send_message(&ack_for(&file_id, &Err(e))).await;
                }
            }
            Message::FileChunk {
                file_id,
                index,
                data,
            } => {
                // failures are remembered by the table and reported at file_end
                match self.transfers.chunk(&file_id, index, &data) {
                    Ok(_) => {
                        if let Some(percent) = self.transfers.progress(&file_id) {
                            tracing::debug!("Receiving {}: {}%", file_id, percent);
                        }
                    }
                    Err(e) => tracing::debug!("Chunk {} of {}: {}", index, file_id, e),
                }
            }
            Message::FileEnd { file_id } => {
                let result = self.transfers.finish(&file_id).await;
                if let Err(e) = &result {
                    tracing::warn!("Upload {} failed: {}", file_id, e);
                }
                sink.send_message(&ack_for(&file_id, &result)).await;
            }
            Message::FileAck {
                file_id,
                status,
                error,
            } => match status {
                Status::Success => tracing::info!("Peer stored {}", file_id),
                Status::Error => tracing::warn!(
                    "Peer rejected {}: {}",
                    file_id,
                    error.unwrap_or_default()
                ),
            },
            _ => {}
        }
    }
}
