//! Client Registry: static, file-backed client descriptors plus an optional
//! in-memory dynamic registration overlay. Exact-match redirect URI
//! checking, the way `clients.Lookup` in the original source treats a
//! non-matching `redirect_uri` as untrusted rather than attempting to
//! redirect an error back to it.

use std::collections::HashMap;
use std::path::Path;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

/// A single registered OAuth 2 / OIDC client, as found in the
/// `identifier-registration-conf` JSON file or created by dynamic
/// registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientDetails {
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    pub redirect_uris: Vec<String>,
    /// Trusted clients skip the consent prompt entirely (the scopes they
    /// request are auto-approved), mirroring `kc.go`'s `promptConsent`
    /// short-circuit for clients the operator has explicitly vouched for.
    #[serde(default)]
    pub trusted: bool,
    #[serde(default)]
    pub client_name: Option<String>,
    #[serde(default)]
    pub application_type: Option<String>,
}

impl ClientDetails {
    pub fn allows_redirect_uri(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|u| u == redirect_uri)
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unknown client_id")]
    UnknownClient,
    #[error("redirect_uri not registered for this client")]
    RedirectUriMismatch,
}

#[derive(Debug, Default, Deserialize)]
struct RegistrationFile {
    #[serde(default)]
    clients: Vec<ClientDetails>,
}

/// Client lookup and (optionally) dynamic registration. The static set is
/// loaded once at startup from `identifier-registration-conf`; dynamically
/// registered clients live only in memory for the life of the process —
/// the original source doesn't persist them either, and SPEC_FULL names no
/// requirement that registration survive a restart.
pub struct ClientRegistry {
    static_clients: HashMap<String, ClientDetails>,
    dynamic_clients: RwLock<HashMap<String, ClientDetails>>,
    allow_dynamic_registration: bool,
}

impl ClientRegistry {
    pub fn load(path: Option<&Path>, allow_dynamic_registration: bool) -> anyhow::Result<Self> {
        let static_clients = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
                let file: RegistrationFile = serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;
                file.clients
                    .into_iter()
                    .map(|c| (c.client_id.clone(), c))
                    .collect()
            }
            None => HashMap::new(),
        };

        Ok(ClientRegistry {
            static_clients,
            dynamic_clients: RwLock::new(HashMap::new()),
            allow_dynamic_registration,
        })
    }

    /// Looks up `client_id` and checks `redirect_uri` against its exact
    /// registered list. Both static and dynamic registries are searched.
    pub async fn lookup(&self, client_id: &str, redirect_uri: &str) -> Result<ClientDetails, ClientError> {
        let client = self.lookup_client(client_id).await.ok_or(ClientError::UnknownClient)?;
        if !client.allows_redirect_uri(redirect_uri) {
            return Err(ClientError::RedirectUriMismatch);
        }
        Ok(client)
    }

    pub async fn lookup_client(&self, client_id: &str) -> Option<ClientDetails> {
        if let Some(c) = self.static_clients.get(client_id) {
            return Some(c.clone());
        }
        self.dynamic_clients.read().await.get(client_id).cloned()
    }

    pub fn dynamic_registration_enabled(&self) -> bool {
        self.allow_dynamic_registration
    }

    /// Registers a new client from a dynamic client registration request
    /// (RFC 7591-ish subset). Generates `client_id`/`client_secret`.
    pub async fn register(&self, redirect_uris: Vec<String>, client_name: Option<String>) -> anyhow::Result<ClientDetails> {
        if !self.allow_dynamic_registration {
            return Err(anyhow::anyhow!("dynamic client registration is disabled"));
        }
        if redirect_uris.is_empty() {
            return Err(anyhow::anyhow!("redirect_uris must not be empty"));
        }

        let client_id = generate_opaque_id(16);
        let client_secret = generate_opaque_id(32);

        let client = ClientDetails {
            client_id: client_id.clone(),
            client_secret: Some(client_secret),
            redirect_uris,
            trusted: false,
            client_name,
            application_type: None,
        };

        self.dynamic_clients.write().await.insert(client_id, client.clone());
        Ok(client)
    }
}

fn generate_opaque_id(num_bytes: usize) -> String {
    use base64::Engine as _;
    let mut buf = vec![0u8; num_bytes];
    rand::rng().fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str, redirects: &[&str], trusted: bool) -> ClientDetails {
        ClientDetails {
            client_id: id.into(),
            client_secret: None,
            redirect_uris: redirects.iter().map(|s| s.to_string()).collect(),
            trusted,
            client_name: None,
            application_type: None,
        }
    }

    fn registry_with(clients: Vec<ClientDetails>, allow_dynamic: bool) -> ClientRegistry {
        ClientRegistry {
            static_clients: clients.into_iter().map(|c| (c.client_id.clone(), c)).collect(),
            dynamic_clients: RwLock::new(HashMap::new()),
            allow_dynamic_registration: allow_dynamic,
        }
    }

    #[tokio::test]
    async fn lookup_rejects_unknown_client() {
        let registry = registry_with(vec![], false);
        let err = registry.lookup("nope", "https://rp/cb").await.unwrap_err();
        assert!(matches!(err, ClientError::UnknownClient));
    }

    #[tokio::test]
    async fn lookup_rejects_mismatched_redirect_uri() {
        let registry = registry_with(vec![client("c1", &["https://rp/cb"], false)], false);
        let err = registry.lookup("c1", "https://evil.example/cb").await.unwrap_err();
        assert!(matches!(err, ClientError::RedirectUriMismatch));
    }

    #[tokio::test]
    async fn lookup_succeeds_on_exact_match() {
        let registry = registry_with(vec![client("c1", &["https://rp/cb"], true)], false);
        let found = registry.lookup("c1", "https://rp/cb").await.unwrap();
        assert!(found.trusted);
    }

    #[tokio::test]
    async fn dynamic_registration_round_trips_through_lookup() {
        let registry = registry_with(vec![], true);
        let registered = registry
            .register(vec!["https://rp.example/cb".into()], Some("My RP".into()))
            .await
            .unwrap();
        let found = registry.lookup(&registered.client_id, "https://rp.example/cb").await.unwrap();
        assert_eq!(found.client_id, registered.client_id);
    }

    #[tokio::test]
    async fn dynamic_registration_rejected_when_disabled() {
        let registry = registry_with(vec![], false);
        let err = registry.register(vec!["https://rp/cb".into()], None).await.unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }
}
