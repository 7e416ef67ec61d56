//! ICE Module - STUN/TURN Konfiguration
//!
//! - Statischer Fallback (öffentliche STUN/TURN Server)
//! - Dynamische TURN-Credentials über HTTP
//! - Prozessweiter Cache mit Ablaufzeit

mod credentials;
mod provider;
mod servers;

use thiserror::Error;

pub use credentials::{parse_credentials, CredentialSource, HttpCredentialSource};
pub use provider::{IceConfigProvider, IceOrigin, IceSettings};
pub use servers::{fallback_ice_servers, merge_servers, IceServer, IceServerSet, IceTransportPolicy};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum IceError {
    #[error("Invalid credential endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Credential request failed: {0}")]
    Http(String),

    #[error("Credential endpoint returned HTTP {0}")]
    Status(u16),

    #[error("Invalid credential payload: {0}")]
    InvalidPayload(String),

    #[error("Credential request timed out")]
    Timeout,
}
