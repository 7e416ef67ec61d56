//! TURN-Credentials vom HTTP-Endpoint
//!
//! Der Endpoint wird mit der gewünschten Gültigkeit (`?ttl=<sekunden>`)
//! aufgerufen und liefert eine JSON-Liste von ICE-Server Einträgen, entweder
//! direkt oder als `{"iceServers": [...]}`.

use super::servers::IceServer;
use super::IceError;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Quelle für dynamisch ausgestellte ICE-Server
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self, ttl: Duration) -> Result<Vec<IceServer>, IceError>;
}

// ============================================================================
// WIRE FORMAT
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Urls {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct ServerDescriptor {
    urls: Urls,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    credential: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CredentialResponse {
    List(Vec<ServerDescriptor>),
    Wrapped {
        #[serde(rename = "iceServers")]
        ice_servers: Vec<ServerDescriptor>,
    },
}

impl From<ServerDescriptor> for IceServer {
    fn from(descriptor: ServerDescriptor) -> Self {
        let urls = match descriptor.urls {
            Urls::One(url) => vec![url],
            Urls::Many(urls) => urls,
        };
        IceServer {
            urls,
            username: descriptor.username,
            credential: descriptor.credential,
        }
    }
}

/// Parst die Antwort des Endpoints
pub fn parse_credentials(body: &str) -> Result<Vec<IceServer>, IceError> {
    let response: CredentialResponse =
        serde_json::from_str(body).map_err(|e| IceError::InvalidPayload(e.to_string()))?;
    let descriptors = match response {
        CredentialResponse::List(list) => list,
        CredentialResponse::Wrapped { ice_servers } => ice_servers,
    };
    Ok(descriptors.into_iter().map(IceServer::from).collect())
}

// ============================================================================
// HTTP SOURCE
// ============================================================================

/// Credential-Endpoint über HTTP
pub struct HttpCredentialSource {
    client: reqwest::Client,
    endpoint: url::Url,
    api_key: Option<String>,
}

impl HttpCredentialSource {
    pub fn new(
        endpoint: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, IceError> {
        let endpoint =
            url::Url::parse(endpoint).map_err(|e| IceError::InvalidEndpoint(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IceError::Http(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self, ttl: Duration) -> Result<Vec<IceServer>, IceError> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("ttl", &ttl.as_secs().to_string());

        let mut request = self.client.get(url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                IceError::Timeout
            } else {
                IceError::Http(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(IceError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| IceError::Http(e.to_string()))?;
        parse_credentials(&body)
    }
}

impl std::fmt::Debug for HttpCredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpCredentialSource")
            .field("endpoint", &self.endpoint.as_str())
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}
