use serde::{Deserialize, Serialize};

/// A persisted scope approval, addressed by an opaque reference handed back
/// to the identity manager's caller. Backs `ApproveScopes`/`ApprovedScopes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentApprovalRecord {
    pub reference: String,
    pub subject: String,
    pub audience: String,
    pub approved_scopes: Vec<String>,
    pub created_epoch: i64,
}

/// An in-flight authorization code, bound to the authentication request and
/// auth record that produced it. Single-use, enforced by the persistence
/// layer via `consume_authorization_code_async`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCodeRecord {
    pub code: String,
    pub client_id: String,
    pub subject: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub nonce: Option<String>,
    /// Signing algorithm used for the ID token this code will redeem,
    /// needed to recompute `c_hash` at the token endpoint.
    pub code_hash_alg: String,
    pub expiry_epoch: i64,
    /// Identity claims established when the code was minted, so the token
    /// endpoint can mint an ID token without re-authenticating the subject.
    pub claims: serde_json::Map<String, serde_json::Value>,
    /// `auth_time` of the authenticating session, carried through to the ID
    /// token minted at redemption.
    pub auth_time: i64,
}

/// A persisted refresh token. `manager_ref` carries whatever opaque
/// reference the identity manager needs to re-fetch the subject on refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub token_id: String,
    pub client_id: String,
    pub subject: String,
    pub scopes: Vec<String>,
    pub manager_ref: Option<String>,
    pub expiry_epoch: i64,
    /// Identity claims to carry into any ID token reissued alongside a
    /// refreshed access token.
    pub claims: serde_json::Map<String, serde_json::Value>,
    pub auth_time: i64,
}
