//! Identity Manager (C4): the contract every authentication backend
//! implements, plus the shared `Outcome` type that replaces the Go
//! original's `IsHandledError{}` sentinel with an explicit return value
//! (SPEC_FULL §9's Rust realization note).
//!
//! Grounded directly on `identity/managers/kc.go`'s `Authenticate`/
//! `Authorize`/`ApproveScopes`/`ApprovedScopes` branch-by-branch; see
//! DESIGN.md for the scope decision collapsing `cookie`/`kc`/`ldap` into one
//! shared logon-cookie-trusting implementation (no Keycloak/LDAP client
//! crate is part of this stack) and for `ApproveScopes`/`ApprovedScopes`
//! being backed by `persist::Database` for real, unlike the Go stubs.

pub mod cookie;
pub mod dummy;
pub mod guest;

use std::collections::BTreeSet;

use async_trait::async_trait;
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::oidc::ar::{Ar, AuthenticationError, error_id};
use crate::oidc::cookies::CookieStore;
use crate::persist::Database;

/// An authenticated user, analogous to the Go original's `Authentication`
/// interface collapsed to one struct (a deliberate idiomatic-Rust redesign;
/// see DESIGN.md).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRecord {
    pub subject: String,
    pub auth_time: i64,
    /// Claims already known about the user at authentication time (from the
    /// logon cookie the external sign-in UI populated). Scope-filtered
    /// again in [`IdentityManager::fetch`] for the userinfo endpoint and for
    /// ID token claim population.
    pub claims: serde_json::Map<String, serde_json::Value>,
}

/// The set of scopes an authorization decision actually grants.
#[derive(Debug, Clone)]
pub struct AuthorizeDecision {
    pub approved_scopes: BTreeSet<String>,
}

/// Replaces `IsHandledError{}`: either the pipeline continues with a value,
/// the request has already been fully handled (a redirect to the external
/// sign-in UI, with any cookies that must ride along), or it failed with a
/// wire-visible OAuth2/OIDC error.
pub enum Outcome<T> {
    Continue(T),
    Handled {
        redirect_to: Url,
        set_cookies: Vec<axum_extra::extract::cookie::Cookie<'static>>,
    },
    Failed(AuthenticationError),
}

/// Per-request context for [`IdentityManager::authenticate`].
pub struct AuthenticateContext<'a> {
    pub ar: &'a Ar,
    pub cookie_jar: &'a CookieJar,
    pub cookies: &'a CookieStore,
    pub sign_in_uri: &'a Url,
    pub raw_query: &'a str,
    /// Whether the requesting client is flagged to allow anonymous guest
    /// access; read from the Client Registry before authentication so the
    /// guest decorator can act on it without a second lookup.
    pub client_allows_guest: bool,
}

/// Per-request context for [`IdentityManager::authorize`].
pub struct AuthorizeContext<'a> {
    pub ar: &'a Ar,
    pub cookie_jar: &'a CookieJar,
    pub cookies: &'a CookieStore,
    pub sign_in_uri: &'a Url,
    pub raw_query: &'a str,
    pub client_trusted: bool,
}

#[async_trait]
pub trait IdentityManager: Send + Sync {
    async fn authenticate(&self, ctx: &AuthenticateContext<'_>) -> anyhow::Result<Outcome<AuthRecord>>;

    async fn authorize(&self, ctx: &AuthorizeContext<'_>, auth: &AuthRecord) -> anyhow::Result<Outcome<AuthorizeDecision>>;

    /// Persists a new consent decision, returning an opaque reference the
    /// caller can round-trip through the consent cookie or a future
    /// request. Backed for real by `persist::Database`.
    async fn approve_scopes(&self, auth: &AuthRecord, audience: &str, scopes: &BTreeSet<String>) -> anyhow::Result<String>;

    /// Looks up a previously approved scope set by reference.
    async fn approved_scopes(&self, auth: &AuthRecord, audience: &str, reference: &str) -> anyhow::Result<Option<BTreeSet<String>>>;

    /// Claims available for `subject`, filtered to `scopes`. Backs both
    /// `userinfo` and ID token claim population.
    async fn fetch(&self, subject: &str, claims: &serde_json::Map<String, serde_json::Value>, scopes: &BTreeSet<String>) -> anyhow::Result<serde_json::Map<String, serde_json::Value>>;

    fn scopes_supported(&self) -> Vec<String>;

    fn claims_supported(&self) -> Vec<String>;

    fn name(&self) -> &'static str;
}

/// Builds the `<sign_in_uri>?flow=<flow>&<original_query>` redirect target
/// used whenever the pipeline needs the external sign-in UI to take over,
/// mirroring the Go original's `signInFormURI` composition.
pub fn sign_in_redirect(sign_in_uri: &Url, flow: &str, raw_query: &str) -> Url {
    let mut url = sign_in_uri.clone();
    let mut query = format!("flow={flow}");
    if !raw_query.is_empty() {
        query.push('&');
        query.push_str(raw_query);
    }
    url.set_query(Some(&query));
    url
}

/// Shared scope-intersection helper for `fetch`: only claims named by
/// `claims_supported` AND requested via scope are returned.
pub fn filter_claims(
    claims: &serde_json::Map<String, serde_json::Value>,
    allowed_keys: &[&str],
) -> serde_json::Map<String, serde_json::Value> {
    claims
        .iter()
        .filter(|(k, _)| allowed_keys.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Persists an approval and returns its reference. Shared by every backend
/// so `ApproveScopes` semantics stay identical regardless of which identity
/// manager issued the approval.
pub async fn persist_approve_scopes(
    db: &Database,
    subject: &str,
    audience: &str,
    scopes: &BTreeSet<String>,
) -> anyhow::Result<String> {
    use rand::RngCore;
    let mut buf = [0u8; 16];
    rand::rng().fill_bytes(&mut buf);
    let reference = hex::encode(buf);

    db.save_consent_approval_async(crate::persist::ConsentApprovalRecord {
        reference: reference.clone(),
        subject: subject.to_string(),
        audience: audience.to_string(),
        approved_scopes: scopes.iter().cloned().collect(),
        created_epoch: crate::oidc::cookies::now_epoch(),
    })
    .await?;

    Ok(reference)
}

pub async fn persist_approved_scopes(
    db: &Database,
    subject: &str,
    audience: &str,
    reference: &str,
) -> anyhow::Result<Option<BTreeSet<String>>> {
    let scopes = db
        .get_consent_approval_async(subject.to_string(), audience.to_string(), reference.to_string())
        .await?;
    Ok(scopes.map(|v| v.into_iter().collect()))
}

/// Shared `error_id`-producing helper so every backend raises the exact same
/// wire error for "no session and prompt=none".
pub fn login_required(ar: &Ar) -> AuthenticationError {
    AuthenticationError {
        error_id: error_id::LOGIN_REQUIRED.to_string(),
        error_description: Some("no active session".into()),
        state: Some(ar.state.clone()).filter(|s| !s.is_empty()),
    }
}
