//! Pairing token issuer
//!
//! One active pairing token per host process. The token travels out of band
//! inside the QR payload and is checked when a peer sends `pair`.

use crate::config::TokenPolicy;
use crate::error::{LinkError, Result};
use crate::protocol::PairingPayload;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex, MutexGuard};
use subtle::ConstantTimeEq;

/// Random bytes behind every token
const TOKEN_BYTES: usize = 16;

/// Identity a host advertises for pairing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingInfo {
    pub server_ip: String,
    pub port: u16,
    pub pairing_token: String,
    pub host_type: Option<String>,
}

impl PairingInfo {
    pub fn to_payload(&self) -> PairingPayload {
        PairingPayload {
            server_ip: self.server_ip.clone(),
            port_no: self.port,
            pairing_token: self.pairing_token.clone(),
            host: self.host_type.clone(),
        }
    }
}

/// Generate an unpredictable token: 16 random bytes, URL-safe base64.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// First non-loopback IPv4 address of this machine.
pub fn detect_lan_ip() -> Result<IpAddr> {
    let interfaces =
        local_ip_address::list_afinet_netifas().map_err(|e| LinkError::LocalIp(e.to_string()))?;

    interfaces
        .into_iter()
        .map(|(_, ip)| ip)
        .find(|ip| matches!(ip, IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified()))
        .ok_or_else(|| LinkError::LocalIp("no non-loopback IPv4 interface".to_string()))
}

/// LAN address or loopback when the machine has no usable interface.
pub fn lan_ip_or_loopback() -> IpAddr {
    detect_lan_ip().unwrap_or_else(|e| {
        tracing::warn!("{}, advertising loopback", e);
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    })
}

/// Build a fresh [`PairingInfo`] for `host_ip:port`.
pub fn issue_pairing(host_ip: IpAddr, port: u16, host_type: Option<String>) -> PairingInfo {
    PairingInfo {
        server_ip: host_ip.to_string(),
        port,
        pairing_token: generate_token(),
        host_type,
    }
}

/// JSON string that goes into the QR code
pub fn render_as_scannable(info: &PairingInfo) -> String {
    info.to_payload().to_qr_data()
}

fn tokens_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

struct IssuerState {
    current: PairingInfo,
    consumed: bool,
    /// Reconnect tokens minted for peers under [`TokenPolicy::SingleUse`]
    peer_tokens: HashSet<String>,
}

/// Holds the active token and validates `pair` requests against it.
pub struct PairingIssuer {
    policy: TokenPolicy,
    state: Mutex<IssuerState>,
}

impl PairingIssuer {
    pub fn new(info: PairingInfo, policy: TokenPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(IssuerState {
                current: info,
                consumed: false,
                peer_tokens: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, IssuerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn policy(&self) -> TokenPolicy {
        self.policy
    }

    /// The pairing identity currently advertised
    pub fn current(&self) -> PairingInfo {
        self.lock().current.clone()
    }

    /// Replace the token. Peers already paired keep their sessions.
    pub fn regenerate(&self) -> PairingInfo {
        let mut state = self.lock();
        state.current.pairing_token = generate_token();
        state.consumed = false;
        tracing::info!("Pairing token regenerated");
        state.current.clone()
    }

    /// Validate a token from a `pair` frame.
    ///
    /// Returns the token the peer should use from now on (echoed in `hello`),
    /// or `None` when the token is not accepted.
    pub fn redeem(&self, token: &str) -> Option<String> {
        let mut state = self.lock();

        if !state.consumed && tokens_match(&state.current.pairing_token, token) {
            return match self.policy {
                TokenPolicy::Reusable => Some(state.current.pairing_token.clone()),
                TokenPolicy::SingleUse => {
                    state.consumed = true;
                    let peer_token = generate_token();
                    state.peer_tokens.insert(peer_token.clone());
                    Some(peer_token)
                }
            };
        }

        state
            .peer_tokens
            .iter()
            .find(|known| tokens_match(known, token))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(token: &str) -> PairingInfo {
        PairingInfo {
            server_ip: "192.168.1.10".into(),
            port: 9000,
            pairing_token: token.into(),
            host_type: None,
        }
    }

    #[test]
    fn test_tokens_are_long_and_distinct() {
        let a = generate_token();
        let b = generate_token();
        assert!(a.len() >= 22);
        assert_ne!(a, b);
    }

    #[test]
    fn test_render_uses_wire_field_names() {
        let mut pairing = info("abc123");
        pairing.host_type = Some("desktop".into());
        let json: serde_json::Value = serde_json::from_str(&render_as_scannable(&pairing)).unwrap();
        assert_eq!(json["server_ip"], "192.168.1.10");
        assert_eq!(json["port_no"], 9000);
        assert_eq!(json["pairing_token"], "abc123");
        assert_eq!(json["host"], "desktop");
    }

    #[test]
    fn test_issue_pairing_uses_given_address() {
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        let pairing = issue_pairing(ip, 9100, None);
        assert_eq!(pairing.server_ip, "10.0.0.7");
        assert_eq!(pairing.port, 9100);
        assert!(!pairing.pairing_token.is_empty());
    }

    #[test]
    fn test_reusable_token() {
        let issuer = PairingIssuer::new(info("abc123"), TokenPolicy::Reusable);
        assert_eq!(issuer.redeem("abc123").as_deref(), Some("abc123"));
        assert_eq!(issuer.redeem("abc123").as_deref(), Some("abc123"));
        assert_eq!(issuer.redeem("wrong"), None);
    }

    #[test]
    fn test_regenerate_invalidates_old_token() {
        let issuer = PairingIssuer::new(info("abc123"), TokenPolicy::Reusable);
        let fresh = issuer.regenerate();
        assert_ne!(fresh.pairing_token, "abc123");
        assert_eq!(issuer.redeem("abc123"), None);
        assert!(issuer.redeem(&fresh.pairing_token).is_some());
    }

    #[test]
    fn test_single_use_mints_peer_token() {
        let issuer = PairingIssuer::new(info("abc123"), TokenPolicy::SingleUse);
        let peer = issuer.redeem("abc123").unwrap();
        assert_ne!(peer, "abc123");

        // pairing token is spent, the peer token keeps working
        assert_eq!(issuer.redeem("abc123"), None);
        assert_eq!(issuer.redeem(&peer), Some(peer.clone()));

        // a regenerated token does not revoke existing peers
        issuer.regenerate();
        assert_eq!(issuer.redeem(&peer), Some(peer));
    }
}
