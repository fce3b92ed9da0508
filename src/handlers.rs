//! Host-side channel handlers: clipboard, command, input.
//!
//! OS integration sits behind small backend traits so the handlers can be
//! driven in tests without a desktop session.

use crate::error::{LinkError, Result};
use crate::mux::ChannelHandler;
use crate::protocol::{ClipboardAction, MediaAction, Message, PresentationAction, Status};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Clipboard
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ClipboardBackend: Send + Sync {
    async fn read(&self) -> Result<String>;
    async fn write(&self, text: String) -> Result<()>;
}

/// The desktop clipboard, via arboard
#[derive(Debug, Default)]
pub struct SystemClipboard;

#[async_trait]
impl ClipboardBackend for SystemClipboard {
    async fn read(&self) -> Result<String> {
        tokio::task::spawn_blocking(|| {
            arboard::Clipboard::new()
                .and_then(|mut cb| cb.get_text())
                .map_err(|e| LinkError::Clipboard(e.to_string()))
        })
        .await
        .map_err(|e| LinkError::Clipboard(e.to_string()))?
    }

    async fn write(&self, text: String) -> Result<()> {
        tokio::task::spawn_blocking(move || {
            arboard::Clipboard::new()
                .and_then(|mut cb| cb.set_text(text))
                .map_err(|e| LinkError::Clipboard(e.to_string()))
        })
        .await
        .map_err(|e| LinkError::Clipboard(e.to_string()))?
    }
}

/// In-process clipboard for headless hosts and tests
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    text: Mutex<String>,
}

impl MemoryClipboard {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Mutex::new(text.into()),
        }
    }
}

#[async_trait]
impl ClipboardBackend for MemoryClipboard {
    async fn read(&self) -> Result<String> {
        Ok(self.text.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn write(&self, text: String) -> Result<()> {
        *self.text.lock().unwrap_or_else(|e| e.into_inner()) = text;
        Ok(())
    }
}

pub struct ClipboardHandler<B> {
    backend: B,
}

impl<B: ClipboardBackend> ClipboardHandler<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    fn failure(error: &LinkError) -> Message {
        Message::ClipboardResponse {
            status: Status::Error,
            data: None,
            error: Some(error.status_message()),
        }
    }
}

#[async_trait]
impl<B: ClipboardBackend> ChannelHandler for ClipboardHandler<B> {
    async fn handle(&self, msg: Message) -> Result<Option<Message>> {
        let (action, data) = match msg {
            Message::ClipboardRequest { action, data } => (action, data),
            Message::ClipboardResponse { status, data, .. } => {
                tracing::debug!("Clipboard response from peer: {:?} {:?}", status, data);
                return Ok(None);
            }
            _ => return Ok(None),
        };

        let reply = match action {
            ClipboardAction::Get => match self.backend.read().await {
                Ok(text) => Message::ClipboardResponse {
                    status: Status::Success,
                    data: Some(text),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!("Clipboard read failed: {}", e);
                    Self::failure(&e)
                }
            },
            ClipboardAction::Set => {
                let Some(text) = data else {
                    return Ok(Some(Message::ClipboardResponse {
                        status: Status::Error,
                        data: None,
                        error: Some("Nothing to copy".to_string()),
                    }));
                };
                match self.backend.write(text).await {
                    Ok(()) => Message::ClipboardResponse {
                        status: Status::Success,
                        data: None,
                        error: None,
                    },
                    Err(e) => {
                        tracing::warn!("Clipboard write failed: {}", e);
                        Self::failure(&e)
                    }
                }
            }
        };
        Ok(Some(reply))
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// Split a command line the way a POSIX shell tokenizes words.
///
/// Single quotes are literal, double quotes allow `\"` and `\\`, a backslash
/// outside quotes escapes the next character. No expansion of any kind.
pub fn split_command_line(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(LinkError::Command("unterminated single quote".into())),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err(LinkError::Command("unterminated double quote".into())),
                        },
                        Some(c) => word.push(c),
                        None => return Err(LinkError::Command("unterminated double quote".into())),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => word.push(c),
                    None => return Err(LinkError::Command("trailing backslash".into())),
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }

    if in_word {
        words.push(word);
    }
    Ok(words)
}

/// Tokenize and vet a command before anything is spawned
pub fn parse_command(line: &str) -> Result<Vec<String>> {
    let argv = split_command_line(line)?;
    match argv.first() {
        None => Err(LinkError::Command("command cannot be empty".into())),
        Some(program) if program.eq_ignore_ascii_case("sudo") => {
            Err(LinkError::Command("sudo commands are not supported".into()))
        }
        Some(_) => Ok(argv),
    }
}

/// Runs `command` frames and answers with `command_output`
pub struct CommandHandler {
    timeout: Duration,
}

impl CommandHandler {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub async fn run(&self, line: &str) -> Message {
        let argv = match parse_command(line) {
            Ok(argv) => argv,
            Err(e) => {
                tracing::warn!("Refusing command {:?}: {}", line, e);
                return Message::CommandOutput {
                    output: e.to_string(),
                    exit_code: None,
                };
            }
        };

        tracing::info!("Running {:?}", argv);
        let child = tokio::process::Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Err(_) => {
                return Message::CommandOutput {
                    output: format!("command timed out after {}s", self.timeout.as_secs()),
                    exit_code: None,
                }
            }
            Ok(Err(e)) => {
                return Message::CommandOutput {
                    output: format!("failed to run {}: {}", argv[0], e),
                    exit_code: None,
                }
            }
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut text = stdout.into_owned();
        if !stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }

        let code = output.status.code();
        let lowered = stderr.to_lowercase();
        if code == Some(1) && (lowered.contains("permission denied") || lowered.contains("not permitted")) {
            text.push_str("\nNote: sudo commands are not supported");
        }

        Message::CommandOutput {
            output: text,
            exit_code: code,
        }
    }
}

#[async_trait]
impl ChannelHandler for CommandHandler {
    async fn handle(&self, msg: Message) -> Result<Option<Message>> {
        match msg {
            Message::Command { command } => Ok(Some(self.run(&command).await)),
            Message::CommandOutput { output, exit_code } => {
                tracing::debug!("Command output ({:?}): {}", exit_code, output);
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Media, presentation, remote input
// ---------------------------------------------------------------------------

/// OS input simulation collaborator
#[async_trait]
pub trait InputBackend: Send + Sync {
    async fn media(&self, action: MediaAction, value: Option<i32>) -> Result<()>;
    async fn presentation(&self, action: PresentationAction) -> Result<()>;
    /// Absolute pointer position, both axes in `0.0..=1.0`
    async fn pointer(&self, x: f64, y: f64) -> Result<()>;
}

/// Backend that only logs what it was asked to do
#[derive(Debug, Default)]
pub struct LoggingInput;

#[async_trait]
impl InputBackend for LoggingInput {
    async fn media(&self, action: MediaAction, value: Option<i32>) -> Result<()> {
        tracing::info!("media {:?} {:?}", action, value);
        Ok(())
    }

    async fn presentation(&self, action: PresentationAction) -> Result<()> {
        tracing::info!("presentation {:?}", action);
        Ok(())
    }

    async fn pointer(&self, x: f64, y: f64) -> Result<()> {
        tracing::debug!("pointer {:.3},{:.3}", x, y);
        Ok(())
    }
}

/// Handles `media`, `presentation` and `remote_input`. No replies.
pub struct InputHandler<B> {
    backend: B,
}

impl<B: InputBackend> InputHandler<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: InputBackend> ChannelHandler for InputHandler<B> {
    async fn handle(&self, msg: Message) -> Result<Option<Message>> {
        match msg {
            Message::Media { action, value } => self.backend.media(action, value).await?,
            Message::Presentation { action } => self.backend.presentation(action).await?,
            Message::RemoteInput {
                normalized_x,
                normalized_y,
                ..
            } => {
                self.backend
                    .pointer(normalized_x.clamp(0.0, 1.0), normalized_y.clamp(0.0, 1.0))
                    .await?
            }
            _ => {}
        }
        Ok(None)
    }
}
