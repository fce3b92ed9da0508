//! crosslink - phone/desktop link over the LAN
//!
//! Usage:
//!   crosslink host                      # Serve and show the pairing QR code (Enter: new token)
//!   crosslink connect <ip> <port> <tok> # Pair with a host
//!   crosslink connect --payload '<json>'
//!   crosslink send <file>               # Upload a file to a paired host
//!   crosslink clipboard get|set <text>
//!   crosslink run <command...>
//!   crosslink devices list|rename|remove

use clap::{Parser, Subcommand};
use colored::Colorize;
use crosslink::autoconnect::{auto_connect, AutoConnectOptions};
use crosslink::config::{self, Config, TokenPolicy};
use crosslink::host::{default_handlers, Host, HostOptions};
use crosslink::pairing::PairingInfo;
use crosslink::protocol::{ClipboardAction, Message, PairingPayload, Status};
use crosslink::registry::{Device, DeviceRegistry};
use crosslink::session::{SessionConfig, TransportSession};
use crosslink::{qr, transfer, LinkError, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

/// How long to wait for a host to answer a request
const REPLY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "crosslink")]
#[command(version)]
#[command(about = "Pair your phone with your desktop over the LAN", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the host server and show the pairing QR code
    Host {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Use this pairing token instead of a random one
        #[arg(long)]
        token: Option<String>,
        /// Pairing token works once; peers get their own reconnect token
        #[arg(long)]
        single_use: bool,
        /// Don't print the QR code
        #[arg(long)]
        no_qr: bool,
    },
    /// Pair with a host and print what it sends
    Connect {
        ip: Option<String>,
        port: Option<u16>,
        token: Option<String>,
        /// Scanned pairing payload (JSON) instead of ip/port/token
        #[arg(long, conflicts_with_all = ["ip", "port", "token"])]
        payload: Option<String>,
        /// Name to save the device under
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Upload a file
    Send {
        file: PathBuf,
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Read or write the host clipboard
    Clipboard {
        #[command(subcommand)]
        action: ClipboardCommand,
        #[arg(short, long, global = true)]
        device: Option<String>,
    },
    /// Run a command on the host
    Run {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Manage paired devices
    Devices {
        #[command(subcommand)]
        action: DevicesCommand,
    },
}

#[derive(Subcommand)]
enum ClipboardCommand {
    Get,
    Set { text: String },
}

#[derive(Subcommand)]
enum DevicesCommand {
    List,
    Rename { id: String, name: String },
    Remove { id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "crosslink=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = config::load_config();
    let registry = DeviceRegistry::new(config::registry_path());

    let result = match cli.command {
        Commands::Host {
            port,
            token,
            single_use,
            no_qr,
        } => run_host(&config, port, token, single_use, no_qr).await,
        Commands::Connect {
            ip,
            port,
            token,
            payload,
            name,
        } => run_connect(&config, &registry, ip, port, token, payload, name).await,
        Commands::Send { file, device } => run_send(&config, &registry, device, &file).await,
        Commands::Clipboard { action, device } => run_clipboard(&config, &registry, device, action).await,
        Commands::Run { command, device } => run_command(&config, &registry, device, &command.join(" ")).await,
        Commands::Devices { action } => run_devices(&registry, action).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::debug!("{}", e);
            eprintln!("{}: {}", "Error".red().bold(), e.status_message());
            ExitCode::FAILURE
        }
    }
}

async fn run_host(
    config: &Config,
    port: Option<u16>,
    token: Option<String>,
    single_use: bool,
    no_qr: bool,
) -> Result<ExitCode> {
    let mut options = HostOptions::from(config);
    if let Some(port) = port {
        options.port = port;
    }
    options.token = token;
    if single_use {
        options.token_policy = TokenPolicy::SingleUse;
    }

    let host = Host::new(options)
        .with_handlers(default_handlers(config))
        .start()
        .await?;

    show_pairing(&host.pairing(), no_qr)?;
    println!("{}", "Press Enter for a new pairing token, Ctrl+C to stop".dimmed());

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(_)) => {
                    // paired devices keep their connection
                    show_pairing(&host.regenerate_token(), no_qr)?;
                }
                Ok(None) | Err(_) => stdin_open = false,
            },
        }
    }
    println!("\n{}", "Shutting down...".dimmed());
    host.shutdown().await;
    Ok(ExitCode::SUCCESS)
}

fn show_pairing(pairing: &PairingInfo, no_qr: bool) -> Result<()> {
    if no_qr {
        println!(
            "{} ws://{}:{} token {}",
            "Listening on".green(),
            pairing.server_ip,
            pairing.port,
            pairing.pairing_token.bold()
        );
        Ok(())
    } else {
        qr::display_pairing(pairing)
    }
}

async fn run_connect(
    config: &Config,
    registry: &DeviceRegistry,
    ip: Option<String>,
    port: Option<u16>,
    token: Option<String>,
    payload: Option<String>,
    name: Option<String>,
) -> Result<ExitCode> {
    let payload = match (payload, ip, token) {
        (Some(raw), _, _) => PairingPayload::from_qr_data(&raw)?,
        (None, Some(ip), Some(token)) => PairingPayload {
            server_ip: ip,
            port_no: port.unwrap_or(config::DEFAULT_PORT),
            pairing_token: token,
            host: None,
        },
        _ => {
            return Err(LinkError::Protocol(
                "give ip, port and token, or --payload".to_string(),
            ))
        }
    };

    let session = TransportSession::new(SessionConfig::from(config));
    session
        .connect(&payload.server_ip, payload.port_no, &payload.pairing_token)
        .await?;

    let mut device = Device::new(
        payload.server_ip.clone(),
        payload.port_no,
        session.token().unwrap_or(payload.pairing_token),
        name.or_else(|| payload.host.clone())
            .unwrap_or_else(|| payload.server_ip.clone()),
    );
    device.host_type = payload.host;
    registry.save(device.clone()).await;
    registry.update_last_connected(&device.id).await;

    println!("{} {} ({})", "Paired with".green(), device.name.bold(), device.id);
    println!("{}", "Press Ctrl+C to disconnect".dimmed());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            msg = session.recv() => match msg {
                Some(msg) => println!("{}", msg.to_json()),
                None => break,
            },
        }
    }
    session.disconnect();
    Ok(ExitCode::SUCCESS)
}

/// Connect to `device`, or to whichever paired device answers first
async fn open_session(config: &Config, registry: &DeviceRegistry, device: Option<String>) -> Result<TransportSession> {
    let session = TransportSession::new(SessionConfig::from(config));

    match device {
        Some(id) => {
            let device = registry.get(&id).await.ok_or(LinkError::NoDevices)?;
            session.connect(&device.ip, device.port, &device.token).await?;
            registry.update_last_connected(&device.id).await;
            tracing::info!("Connected to {}", device.name);
        }
        None => {
            let cancel = CancellationToken::new();
            let canceller = cancel.clone();
            let watcher = tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                canceller.cancel();
            });
            let result = auto_connect(registry, &session, &AutoConnectOptions::from(config), &cancel).await;
            watcher.abort();
            let device = result?;
            tracing::info!("Connected to {}", device.name);
        }
    }
    Ok(session)
}

/// Wait for the first inbound message `pick` accepts
async fn await_reply<T>(
    session: &TransportSession,
    what: &'static str,
    mut pick: impl FnMut(Message) -> Option<T>,
) -> Result<T> {
    let wait = async {
        while let Some(msg) = session.recv().await {
            if let Some(found) = pick(msg) {
                return Some(found);
            }
        }
        None
    };
    match tokio::time::timeout(REPLY_TIMEOUT, wait).await {
        Ok(Some(found)) => Ok(found),
        _ => Err(LinkError::NoReply(what)),
    }
}

async fn run_send(config: &Config, registry: &DeviceRegistry, device: Option<String>, file: &Path) -> Result<ExitCode> {
    let session = open_session(config, registry, device).await?;
    let cancel = CancellationToken::new();

    let meta = transfer::send_path(&session, file, config.chunk_size, &cancel, |percent| {
        print!("\r{} {}%", "Sending".cyan(), percent);
        let _ = std::io::stdout().flush();
    })
    .await?;
    println!();

    let file_id = meta.file_id.clone();
    let ack = await_reply(&session, "file_ack", |msg| match msg {
        Message::FileAck { file_id: id, status, error } if id == file_id => Some((status, error)),
        _ => None,
    })
    .await;
    session.disconnect();

    match ack? {
        (Status::Success, _) => {
            println!("{} {} ({} bytes)", "Sent".green(), meta.name, meta.size);
            Ok(ExitCode::SUCCESS)
        }
        (Status::Error, error) => {
            eprintln!(
                "{} {}",
                "Host rejected the file:".red(),
                error.unwrap_or_default()
            );
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_clipboard(
    config: &Config,
    registry: &DeviceRegistry,
    device: Option<String>,
    action: ClipboardCommand,
) -> Result<ExitCode> {
    let session = open_session(config, registry, device).await?;
    let request = match action {
        ClipboardCommand::Get => Message::ClipboardRequest {
            action: ClipboardAction::Get,
            data: None,
        },
        ClipboardCommand::Set { text } => Message::ClipboardRequest {
            action: ClipboardAction::Set,
            data: Some(text),
        },
    };
    if !session.send(&request) {
        return Err(LinkError::NotAuthenticated);
    }

    let reply = await_reply(&session, "clipboard_response", |msg| match msg {
        Message::ClipboardResponse { status, data, error } => Some((status, data, error)),
        _ => None,
    })
    .await;
    session.disconnect();

    match reply? {
        (Status::Success, data, _) => {
            if let Some(text) = data {
                println!("{}", text);
            }
            Ok(ExitCode::SUCCESS)
        }
        (Status::Error, _, error) => {
            eprintln!("{} {}", "Clipboard error:".red(), error.unwrap_or_default());
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn run_command(config: &Config, registry: &DeviceRegistry, device: Option<String>, command: &str) -> Result<ExitCode> {
    let session = open_session(config, registry, device).await?;
    let request = Message::Command {
        command: command.to_string(),
    };
    if !session.send(&request) {
        return Err(LinkError::NotAuthenticated);
    }

    let reply = await_reply(&session, "command_output", |msg| match msg {
        Message::CommandOutput { output, exit_code } => Some((output, exit_code)),
        _ => None,
    })
    .await;
    session.disconnect();

    let (output, exit_code) = reply?;
    print!("{}", output);
    if !output.ends_with('\n') {
        println!();
    }
    Ok(match exit_code {
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::FAILURE,
    })
}

async fn run_devices(registry: &DeviceRegistry, action: DevicesCommand) -> Result<ExitCode> {
    match action {
        DevicesCommand::List => {
            let devices = registry.auto_connect_candidates().await;
            if devices.is_empty() {
                println!("{}", "No paired devices".dimmed());
            }
            for device in devices {
                let seen = device
                    .last_connected
                    .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
                    .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}  {}  {}  {}",
                    device.id.cyan(),
                    device.name.bold(),
                    device.host_type.unwrap_or_default().dimmed(),
                    seen.dimmed()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        DevicesCommand::Rename { id, name } => Ok(report(registry.update_name(&id, &name).await, &id)),
        DevicesCommand::Remove { id } => Ok(report(registry.remove(&id).await, &id)),
    }
}

fn report(changed: bool, id: &str) -> ExitCode {
    if changed {
        println!("{} {}", "Updated".green(), id);
        ExitCode::SUCCESS
    } else {
        eprintln!("{} {}", "No device".yellow(), id);
        ExitCode::FAILURE
    }
}
