//! ICE Server Typen und statischer Fallback

use serde::{Deserialize, Serialize};

// ============================================================================
// ICE SERVER
// ============================================================================

/// Ein STUN- oder TURN-Server Eintrag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(urls: &[&str]) -> Self {
        Self {
            urls: urls.iter().map(|u| u.to_string()).collect(),
            username: None,
            credential: None,
        }
    }

    pub fn turn(urls: &[&str], username: &str, credential: &str) -> Self {
        Self {
            urls: urls.iter().map(|u| u.to_string()).collect(),
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }

    pub fn is_stun(&self) -> bool {
        self.urls.iter().any(|u| u.starts_with("stun:") || u.starts_with("stuns:"))
    }

    pub fn is_turn(&self) -> bool {
        self.urls.iter().any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }

    /// Mindestens eine URL mit bekanntem Schema, TURN nur mit Credentials
    pub fn is_usable(&self) -> bool {
        if self.urls.is_empty() || !(self.is_stun() || self.is_turn()) {
            return false;
        }
        !self.is_turn() || (self.username.is_some() && self.credential.is_some())
    }
}

/// ICE Transport Policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceTransportPolicy {
    /// Alle Kandidaten (host, srflx, relay)
    All,
    /// Nur TURN-Relay Kandidaten
    Relay,
}

/// Aufgelöste Server-Liste für eine neue Peer Connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerSet {
    pub servers: Vec<IceServer>,
    pub pool_size: u8,
    pub policy: IceTransportPolicy,
}

impl IceServerSet {
    pub fn has_stun(&self) -> bool {
        self.servers.iter().any(IceServer::is_stun)
    }

    pub fn has_turn(&self) -> bool {
        self.servers.iter().any(IceServer::is_turn)
    }
}

// ============================================================================
// STATIC FALLBACK
// ============================================================================

/// Öffentliche STUN/TURN Server, falls keine dynamischen Credentials verfügbar sind
pub fn fallback_ice_servers() -> Vec<IceServer> {
    vec![
        // Google STUN Server (kostenlos, für ~90% der Verbindungen)
        IceServer::stun(&[
            "stun:stun.l.google.com:19302",
            "stun:stun1.l.google.com:19302",
            "stun:stun2.l.google.com:19302",
        ]),
        // Open Relay Project (öffentlicher TURN)
        IceServer::turn(
            &[
                "turn:openrelay.metered.ca:80",
                "turn:openrelay.metered.ca:443",
                "turn:openrelay.metered.ca:443?transport=tcp",
            ],
            "openrelayproject",
            "openrelayproject",
        ),
    ]
}

/// Fügt `extra` an `base` an, doppelte URL-Listen werden übersprungen
pub fn merge_servers(base: Vec<IceServer>, extra: &[IceServer]) -> Vec<IceServer> {
    let mut merged = base;
    for server in extra {
        if !merged.iter().any(|s| s.urls == server.urls) {
            merged.push(server.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_has_stun_and_turn() {
        let servers = fallback_ice_servers();
        assert!(servers.iter().any(IceServer::is_stun));
        assert!(servers.iter().any(IceServer::is_turn));
        assert!(servers.iter().all(IceServer::is_usable));
    }

    #[test]
    fn test_turn_without_credentials_is_unusable() {
        let server = IceServer {
            urls: vec!["turn:example.org:3478".into()],
            username: None,
            credential: None,
        };
        assert!(!server.is_usable());
        assert!(!IceServer::stun(&["http://example.org"]).is_usable());
    }

    #[test]
    fn test_merge_skips_duplicates() {
        let merged = merge_servers(fallback_ice_servers(), &fallback_ice_servers());
        assert_eq!(merged.len(), fallback_ice_servers().len());
    }
}
