//! Consent & Cookie Store (C5): browser-state, session, logon and consent
//! cookies. Every cookie payload is JSON, AEAD-sealed with AES-256-GCM under
//! the provider's `--encryption-secret`, and carried as a `__Secure-`
//! prefixed, `HttpOnly` cookie read/written through `axum-extra`'s typed
//! `CookieJar` rather than the teacher's manual `Cookie:` header parsing
//! (see DESIGN.md).

use std::time::{SystemTime, UNIX_EPOCH};

use aws_lc_rs::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use aws_lc_rs::rand::{SecureRandom, SystemRandom};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use serde::{Serialize, de::DeserializeOwned};

/// Name of the browser state cookie (`BrowserStateCookieName` in the
/// bootstrap, always `__Secure-KKBS` per SPEC_FULL §4.5).
pub const BSC_COOKIE_NAME: &str = "__Secure-KKBS";
/// Name of the session cookie (`SessionCookieName`, always `__Secure-KKCS`).
pub const SESSION_COOKIE_NAME: &str = "__Secure-KKCS";
/// Provider-internal logon cookie backing the `cookie`/`kc`/`ldap` identity
/// managers' "is there already an authenticated user" check. Not named in
/// SPEC_FULL §4.5 (only BSC/session are); chosen to read unambiguously
/// rather than collide with either spec-mandated name.
pub const LOGON_COOKIE_NAME: &str = "__Secure-KKLOGON";
/// Provider-internal consent cookie recording the outcome of a consent
/// prompt round-trip through the external sign-in UI.
pub const CONSENT_COOKIE_NAME: &str = "__Secure-KKCONSENT";

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct LogonCookiePayload {
    pub subject: String,
    pub auth_time: i64,
    /// Claims the external sign-in UI gathered about the user at login
    /// time (name, email, groups, ...); scope-filtered again by the
    /// identity manager's `fetch`.
    #[serde(default)]
    pub claims: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct SessionCookiePayload {
    pub subject: String,
    /// Opaque reference correlating this session to the browser state
    /// cookie; folded into `session_state` computation.
    pub session_ref: String,
}

#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct ConsentCookiePayload {
    pub subject: String,
    pub client_id: String,
    pub allow: bool,
    pub approved_scopes: Vec<String>,
}

impl ConsentCookiePayload {
    /// Intersects the requested scopes with what was actually approved,
    /// mirroring `consent.ApprovedScopes(ar.Scopes)` in `kc.go`.
    pub fn approved_subset(&self, requested: &std::collections::BTreeSet<String>) -> std::collections::BTreeSet<String> {
        requested.iter().filter(|s| self.approved_scopes.iter().any(|a| a == *s)).cloned().collect()
    }
}

/// Seals/opens cookie payloads with AES-256-GCM under a fixed 32-byte key.
pub struct CookieStore {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl CookieStore {
    /// `secret` must be exactly 32 bytes, as validated by
    /// [`crate::config::Config::load`].
    pub fn new(secret: &[u8]) -> anyhow::Result<Self> {
        let unbound = UnboundKey::new(&AES_256_GCM, secret).map_err(|_| anyhow::anyhow!("invalid AES-256-GCM key length"))?;
        Ok(CookieStore { key: LessSafeKey::new(unbound), rng: SystemRandom::new() })
    }

    fn seal(&self, plaintext: &[u8]) -> anyhow::Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).map_err(|_| anyhow::anyhow!("rng failure"))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| anyhow::anyhow!("seal failure"))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&in_out);
        Ok(B64.encode(out))
    }

    fn open(&self, token: &str) -> anyhow::Result<Vec<u8>> {
        let raw = B64.decode(token)?;
        if raw.len() < NONCE_LEN {
            return Err(anyhow::anyhow!("cookie too short"));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)?;
        let mut in_out = ciphertext.to_vec();
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| anyhow::anyhow!("cookie authentication failed"))?;
        Ok(plaintext.to_vec())
    }

    pub fn seal_value<T: Serialize>(&self, value: &T) -> anyhow::Result<String> {
        let json = serde_json::to_vec(value)?;
        self.seal(&json)
    }

    pub fn open_value<T: DeserializeOwned>(&self, token: &str) -> anyhow::Result<T> {
        let plaintext = self.open(token)?;
        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Reads and opens a named cookie from `jar`, returning `None` on any
    /// absence/decrypt/deserialize failure rather than erroring: an invalid
    /// or expired cookie is simply treated as "no session".
    pub fn read<T: DeserializeOwned>(&self, jar: &CookieJar, name: &str) -> Option<T> {
        let raw = jar.get(name)?.value().to_string();
        self.open_value(&raw).ok()
    }

    /// Builds a `Set-Cookie` entry: `__Secure-` prefixed, `Secure`,
    /// `HttpOnly`, scoped to `path`, with the given `SameSite` policy and
    /// lifetime.
    pub fn build<T: Serialize>(
        &self,
        name: &'static str,
        value: &T,
        path: String,
        same_site: SameSite,
        max_age: Option<time::Duration>,
    ) -> anyhow::Result<Cookie<'static>> {
        let sealed = self.seal_value(value)?;
        let mut cookie = Cookie::new(name, sealed);
        cookie.set_path(path);
        cookie.set_secure(true);
        cookie.set_http_only(true);
        cookie.set_same_site(same_site);
        if let Some(max_age) = max_age {
            cookie.set_max_age(max_age);
        }
        Ok(cookie.into_owned())
    }

    /// A removal cookie: empty value, immediately expired.
    pub fn clear(&self, name: &'static str, path: String) -> Cookie<'static> {
        let mut cookie = Cookie::new(name, "");
        cookie.set_path(path);
        cookie.set_secure(true);
        cookie.set_http_only(true);
        cookie.set_max_age(time::Duration::seconds(0));
        cookie.into_owned()
    }
}

pub fn now_epoch() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// The browser-state cookie path, always `<base>/konnect/v1/session/` per
/// the bootstrap's `makeURIPath(apiTypeKonnect, "/session/")`.
pub fn browser_state_cookie_path(base: &str) -> String {
    format!("{}/konnect/v1/session/", base.trim_end_matches('/'))
}

/// The session cookie's path: the longest common path-segment prefix of the
/// authorization and end-session endpoint paths, as computed by
/// `getCommonURLPathPrefix` in the bootstrap. Falls back to `/` if the two
/// paths share no common segment.
pub fn common_url_path_prefix(a: &str, b: &str) -> String {
    let a_segments: Vec<&str> = a.split('/').filter(|s| !s.is_empty()).collect();
    let b_segments: Vec<&str> = b.split('/').filter(|s| !s.is_empty()).collect();
    let mut common = Vec::new();
    for (x, y) in a_segments.iter().zip(b_segments.iter()) {
        if x == y {
            common.push(*x);
        } else {
            break;
        }
    }
    if common.is_empty() {
        "/".to_string()
    } else {
        format!("/{}/", common.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CookieStore {
        CookieStore::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn seal_open_round_trips() {
        let store = store();
        let payload = LogonCookiePayload { subject: "alice".into(), auth_time: 1234, claims: Default::default() };
        let sealed = store.seal_value(&payload).unwrap();
        let opened: LogonCookiePayload = store.open_value(&sealed).unwrap();
        assert_eq!(opened.subject, "alice");
        assert_eq!(opened.auth_time, 1234);
    }

    #[test]
    fn tampered_cookie_fails_to_open() {
        let store = store();
        let payload = LogonCookiePayload { subject: "alice".into(), auth_time: 1234, claims: Default::default() };
        let mut sealed = store.seal_value(&payload).unwrap();
        sealed.push('x');
        assert!(store.open_value::<LogonCookiePayload>(&sealed).is_err());
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let a = CookieStore::new(&[1u8; 32]).unwrap();
        let b = CookieStore::new(&[2u8; 32]).unwrap();
        let payload = LogonCookiePayload { subject: "alice".into(), auth_time: 1234, claims: Default::default() };
        let sealed = a.seal_value(&payload).unwrap();
        assert!(b.open_value::<LogonCookiePayload>(&sealed).is_err());
    }

    #[test]
    fn common_prefix_of_sibling_paths() {
        assert_eq!(common_url_path_prefix("/konnect/v1/authorize", "/konnect/v1/endsession"), "/konnect/v1/");
    }

    #[test]
    fn common_prefix_falls_back_to_root() {
        assert_eq!(common_url_path_prefix("/authorize", "/logout"), "/");
    }

    #[test]
    fn consent_approved_subset_intersects_requested_scopes() {
        let consent = ConsentCookiePayload {
            subject: "u1".into(),
            client_id: "c1".into(),
            allow: true,
            approved_scopes: vec!["openid".into(), "profile".into()],
        };
        let requested: std::collections::BTreeSet<String> =
            ["openid", "email"].into_iter().map(str::to_string).collect();
        let approved = consent.approved_subset(&requested);
        assert!(approved.contains("openid"));
        assert!(!approved.contains("email"));
    }
}
