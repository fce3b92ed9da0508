//! Auto-connect driver
//!
//! Walks the registry's candidates (most recently used first), giving each
//! one a grace period to authenticate. Between full passes it backs off.

use crate::config::{Config, ReconnectConfig};
use crate::error::{LinkError, Result};
use crate::registry::{Device, DeviceRegistry};
use crate::session::{ReconnectStrategy, TransportSession};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct AutoConnectOptions {
    /// How long one candidate gets to reach `Authenticated`
    pub grace: Duration,
    /// Full passes over the candidate list
    pub rounds: u32,
    pub backoff: ReconnectConfig,
}

impl From<&Config> for AutoConnectOptions {
    fn from(config: &Config) -> Self {
        Self {
            grace: config.auto_connect_grace(),
            rounds: config.auto_connect_rounds.max(1),
            backoff: config.reconnect.clone(),
        }
    }
}

/// Connect `session` to the first paired device that answers.
///
/// On success the device's `lastConnected` is bumped (and its token updated
/// when the host handed out a new one). Cancelling `cancel` stops immediately
/// and leaves the session closed.
pub async fn auto_connect(
    registry: &DeviceRegistry,
    session: &TransportSession,
    options: &AutoConnectOptions,
    cancel: &CancellationToken,
) -> Result<Device> {
    let candidates = registry.auto_connect_candidates().await;
    if candidates.is_empty() {
        return Err(LinkError::NoDevices);
    }

    let mut backoff = ReconnectStrategy::new(&ReconnectConfig {
        max_attempts: options.rounds.saturating_sub(1),
        ..options.backoff.clone()
    });

    loop {
        for device in &candidates {
            tracing::info!("Trying {} ({})", device.name, device.id);
            let attempt = tokio::time::timeout(
                options.grace,
                session.connect(&device.ip, device.port, &device.token),
            );

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    session.disconnect();
                    return Err(LinkError::Cancelled);
                }
                outcome = attempt => outcome,
            };

            match outcome {
                Ok(Ok(())) => return Ok(record_success(registry, session, device).await),
                Ok(Err(e)) => tracing::info!("{} unavailable: {}", device.id, e.status_message()),
                Err(_) => {
                    session.disconnect();
                    tracing::info!("{} did not answer within {:?}", device.id, options.grace);
                }
            }
        }

        let Some(delay) = backoff.next_delay() else {
            break;
        };
        tracing::debug!("No device answered, next pass in {:?}", delay);
        tokio::select! {
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    Err(LinkError::Unreachable)
}

async fn record_success(registry: &DeviceRegistry, session: &TransportSession, device: &Device) -> Device {
    let mut device = device.clone();
    if let Some(token) = session.token() {
        if token != device.token {
            device.token = token;
            registry.save(device.clone()).await;
        }
    }
    registry.update_last_connected(&device.id).await;
    registry.get(&device.id).await.unwrap_or(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;

    fn dead_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn options() -> AutoConnectOptions {
        AutoConnectOptions {
            grace: Duration::from_millis(500),
            rounds: 2,
            backoff: ReconnectConfig {
                max_attempts: 5,
                base_delay_ms: 10,
                max_delay_ms: 10,
            },
        }
    }

    #[tokio::test]
    async fn test_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::new(dir.path().join("devices.json"));
        let session = TransportSession::new(SessionConfig::default());

        let err = auto_connect(&registry, &session, &options(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NoDevices));
    }

    #[tokio::test]
    async fn test_exhaustion_reports_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::new(dir.path().join("devices.json"));
        registry
            .save(Device::new("127.0.0.1", dead_port(), "t", "Gone"))
            .await;
        let session = TransportSession::new(SessionConfig::default());

        let err = auto_connect(&registry, &session, &options(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Unreachable));
    }

    #[tokio::test]
    async fn test_cancel_stops_driver() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::new(dir.path().join("devices.json"));
        registry
            .save(Device::new("127.0.0.1", dead_port(), "t", "Gone"))
            .await;
        let session = TransportSession::new(SessionConfig::default());

        let mut opts = options();
        opts.rounds = 100;
        opts.backoff.base_delay_ms = 60_000;
        opts.backoff.max_delay_ms = 60_000;

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = auto_connect(&registry, &session, &opts, &cancel).await.unwrap_err();
        assert!(matches!(err, LinkError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
