//! Paired device registry
//!
//! Known hosts persisted as a JSON array under one namespaced key of a small
//! JSON key/value file. Storage failures are logged and degrade to an empty
//! list or a no-op; callers never see them.

use crate::error::{LinkError, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Key the device list lives under
pub const DEVICES_STORAGE_KEY: &str = "paired_devices";

/// A host this client has paired with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// Always `"ip:port"`
    pub id: String,
    pub ip: String,
    #[serde(deserialize_with = "port_from_string_or_number")]
    pub port: u16,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_type: Option<String>,
    pub name: String,
    /// Epoch milliseconds of the last successful connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<i64>,
}

impl Device {
    pub fn new(ip: impl Into<String>, port: u16, token: impl Into<String>, name: impl Into<String>) -> Self {
        let ip = ip.into();
        Self {
            id: Self::device_id(&ip, port),
            ip,
            port,
            token: token.into(),
            host_type: None,
            name: name.into(),
            last_connected: None,
        }
    }

    pub fn device_id(ip: &str, port: u16) -> String {
        format!("{}:{}", ip, port)
    }
}

/// Older mobile builds stored the port as a string
fn port_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(p) => Ok(p),
        Port::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Most recently connected first, never-connected last, ties keep stored order.
pub fn order_candidates(mut devices: Vec<Device>) -> Vec<Device> {
    // sort_by is stable
    devices.sort_by(|a, b| match (a.last_connected, b.last_connected) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    devices
}

/// File-backed registry. Every mutation re-reads the store under a lock.
pub struct DeviceRegistry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DeviceRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_store(&self) -> Result<Map<String, Value>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) if content.trim().is_empty() => Ok(Map::new()),
            Ok(content) => serde_json::from_str(&content)
                .map_err(|e| LinkError::Storage(format!("{}: {}", self.path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Map::new()),
            Err(e) => Err(LinkError::Storage(format!("{}: {}", self.path.display(), e))),
        }
    }

    async fn load(&self) -> Result<Vec<Device>> {
        let store = self.read_store().await?;
        match store.get(DEVICES_STORAGE_KEY) {
            Some(value) => serde_json::from_value(value.clone())
                .map_err(|e| LinkError::Storage(format!("{}: {}", DEVICES_STORAGE_KEY, e))),
            None => Ok(Vec::new()),
        }
    }

    async fn store(&self, devices: &[Device]) -> Result<()> {
        let mut store = self.read_store().await.unwrap_or_default();
        store.insert(DEVICES_STORAGE_KEY.to_string(), serde_json::to_value(devices)?);

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // write-then-rename so a crash never leaves half a file
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(&store)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Read-modify-write under the lock. Returns whether anything was persisted.
    async fn mutate<F>(&self, what: &str, f: F) -> bool
    where
        F: FnOnce(&mut Vec<Device>) -> bool,
    {
        let _guard = self.lock.lock().await;
        let mut devices = match self.load().await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Error {}: {}", what, e);
                return false;
            }
        };

        if !f(&mut devices) {
            return false;
        }

        match self.store(&devices).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Error {}: {}", what, e);
                false
            }
        }
    }

    pub async fn get_all(&self) -> Vec<Device> {
        let _guard = self.lock.lock().await;
        self.load().await.unwrap_or_else(|e| {
            tracing::warn!("Error loading devices: {}", e);
            Vec::new()
        })
    }

    pub async fn get(&self, id: &str) -> Option<Device> {
        self.get_all().await.into_iter().find(|d| d.id == id)
    }

    /// Insert or update by `id`. Optional fields missing on `device` keep their stored value.
    pub async fn save(&self, device: Device) -> bool {
        self.mutate("saving device", move |devices| {
            match devices.iter_mut().find(|d| d.id == device.id) {
                Some(existing) => {
                    let host_type = device.host_type.or_else(|| existing.host_type.take());
                    let last_connected = device.last_connected.or(existing.last_connected);
                    *existing = Device {
                        host_type,
                        last_connected,
                        ..device
                    };
                }
                None => devices.push(device),
            }
            true
        })
        .await
    }

    pub async fn update_name(&self, id: &str, name: &str) -> bool {
        self.mutate("updating device name", |devices| {
            match devices.iter_mut().find(|d| d.id == id) {
                Some(device) => {
                    device.name = name.to_string();
                    true
                }
                None => false,
            }
        })
        .await
    }

    pub async fn update_last_connected(&self, id: &str) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        self.mutate("updating last connected time", |devices| {
            match devices.iter_mut().find(|d| d.id == id) {
                Some(device) => {
                    device.last_connected = Some(now);
                    true
                }
                None => false,
            }
        })
        .await
    }

    pub async fn remove(&self, id: &str) -> bool {
        self.mutate("removing device", |devices| {
            let before = devices.len();
            devices.retain(|d| d.id != id);
            devices.len() != before
        })
        .await
    }

    /// Devices in the order auto-connect should try them
    pub async fn auto_connect_candidates(&self) -> Vec<Device> {
        order_candidates(self.get_all().await)
    }
}
