//! Shared logon-cookie-trusting `IdentityManager` implementation, backing
//! the `cookie`, `kc` and `ldap` CLI identity-manager choices.
//!
//! `kc.go` and its LDAP counterpart differ from the plain cookie manager
//! only in how they originally authenticated the user against an upstream
//! Keycloak realm or LDAP directory before setting the logon cookie — work
//! this crate's stack doesn't carry an LDAP/Keycloak client for (no such
//! crate appears anywhere in the pack; see DESIGN.md) and which, per
//! SPEC_FULL's Non-goals, belongs to the external sign-in UI rather than to
//! the provider. All three therefore share this one implementation here;
//! `kc`/`ldap` exist as distinct CLI selections purely so operators can
//! record which external sign-in flow is in effect, and so that future
//! divergence has an obvious place to land.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::oidc::cookies::{CONSENT_COOKIE_NAME, ConsentCookiePayload, CookieStore, LOGON_COOKIE_NAME, LogonCookiePayload};
use crate::oidc::identity::{
    AuthRecord, AuthenticateContext, AuthorizeContext, AuthorizeDecision, IdentityManager, Outcome, filter_claims, login_required,
    persist_approve_scopes, persist_approved_scopes, sign_in_redirect,
};
use crate::oidc::ar::SCOPE_OFFLINE_ACCESS;
use crate::persist::Database;

pub struct LogonCookieIdentityManager {
    db: Arc<Database>,
    name: &'static str,
    scopes_supported: Vec<String>,
    claims_supported: Vec<&'static str>,
}

impl LogonCookieIdentityManager {
    pub fn new(db: Arc<Database>, name: &'static str) -> Self {
        LogonCookieIdentityManager {
            db,
            name,
            scopes_supported: vec!["profile".into(), "email".into()],
            claims_supported: vec!["name", "email"],
        }
    }
}

#[async_trait]
impl IdentityManager for LogonCookieIdentityManager {
    async fn authenticate(&self, ctx: &AuthenticateContext<'_>) -> anyhow::Result<Outcome<AuthRecord>> {
        let logon: Option<LogonCookiePayload> = ctx.cookies.read(ctx.cookie_jar, LOGON_COOKIE_NAME);
        let prompt_none = ctx.ar.prompts.contains("none");
        let force_reauth = ctx.ar.prompts.contains("login") || ctx.ar.prompts.contains("select_account");

        match logon {
            None if prompt_none => Ok(Outcome::Failed(login_required(ctx.ar))),
            None => Ok(Outcome::Handled {
                redirect_to: sign_in_redirect(ctx.sign_in_uri, "oidc", ctx.raw_query),
                set_cookies: Vec::new(),
            }),
            Some(_) if force_reauth => Ok(Outcome::Handled {
                redirect_to: sign_in_redirect(ctx.sign_in_uri, "oidc", ctx.raw_query),
                set_cookies: Vec::new(),
            }),
            Some(logon) => Ok(Outcome::Continue(AuthRecord {
                subject: logon.subject,
                auth_time: logon.auth_time,
                claims: logon.claims,
            })),
        }
    }

    async fn authorize(&self, ctx: &AuthorizeContext<'_>, auth: &AuthRecord) -> anyhow::Result<Outcome<AuthorizeDecision>> {
        let mut prompt_consent = ctx.ar.prompts.contains("consent");
        let mut approved: BTreeSet<String> = BTreeSet::new();

        if !ctx.client_trusted {
            prompt_consent = true;
        } else {
            approved = ctx.ar.scopes.clone();
        }

        let consent: Option<ConsentCookiePayload> = ctx.cookies.read(ctx.cookie_jar, CONSENT_COOKIE_NAME);
        let had_explicit_consent = consent.is_some();

        if let Some(consent) = consent {
            if consent.client_id == ctx.ar.client_id && !consent.allow {
                return Ok(Outcome::Failed(crate::oidc::ar::AuthenticationError {
                    error_id: crate::oidc::ar::error_id::ACCESS_DENIED.to_string(),
                    error_description: Some("user denied consent".into()),
                    state: Some(ctx.ar.state.clone()).filter(|s| !s.is_empty()),
                }));
            }
            if consent.client_id == ctx.ar.client_id {
                prompt_consent = false;
                approved = consent.approved_subset(&ctx.ar.scopes);
            }
        }

        if !had_explicit_consent && approved.contains(SCOPE_OFFLINE_ACCESS) && !prompt_consent {
            approved.remove(SCOPE_OFFLINE_ACCESS);
        }

        if prompt_consent {
            if ctx.ar.prompts.contains("none") {
                return Ok(Outcome::Failed(crate::oidc::ar::AuthenticationError {
                    error_id: crate::oidc::ar::error_id::INTERACTION_REQUIRED.to_string(),
                    error_description: Some("consent required".into()),
                    state: Some(ctx.ar.state.clone()).filter(|s| !s.is_empty()),
                }));
            }
            return Ok(Outcome::Handled {
                redirect_to: sign_in_redirect(ctx.sign_in_uri, "consent", ctx.raw_query),
                set_cookies: Vec::new(),
            });
        }

        let _ = auth;
        Ok(Outcome::Continue(AuthorizeDecision { approved_scopes: approved }))
    }

    async fn approve_scopes(&self, auth: &AuthRecord, audience: &str, scopes: &BTreeSet<String>) -> anyhow::Result<String> {
        persist_approve_scopes(&self.db, &auth.subject, audience, scopes).await
    }

    async fn approved_scopes(&self, auth: &AuthRecord, audience: &str, reference: &str) -> anyhow::Result<Option<BTreeSet<String>>> {
        persist_approved_scopes(&self.db, &auth.subject, audience, reference).await
    }

    async fn fetch(
        &self,
        subject: &str,
        claims: &serde_json::Map<String, serde_json::Value>,
        scopes: &BTreeSet<String>,
    ) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
        let _ = subject;
        let mut allowed: Vec<&str> = Vec::new();
        if scopes.contains("profile") {
            allowed.push("name");
        }
        if scopes.contains("email") {
            allowed.push("email");
        }
        Ok(filter_claims(claims, &allowed))
    }

    fn scopes_supported(&self) -> Vec<String> {
        self.scopes_supported.clone()
    }

    fn claims_supported(&self) -> Vec<String> {
        self.claims_supported.iter().map(|s| s.to_string()).collect()
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oidc::ar::{Flow, RawAuthenticationRequest};
    use crate::oidc::cookies::CookieStore;
    use axum_extra::extract::cookie::CookieJar;
    use url::Url;

    fn bare_ar(prompts: &[&str]) -> crate::oidc::ar::Ar {
        let raw = RawAuthenticationRequest {
            raw_scope: "openid".into(),
            raw_response_type: "code".into(),
            client_id: "c1".into(),
            raw_redirect_uri: "https://rp/cb".into(),
            state: "s1".into(),
            ..Default::default()
        };
        crate::oidc::ar::Ar {
            scopes: ["openid"].into_iter().map(str::to_string).collect(),
            response_types: ["code"].into_iter().map(str::to_string).collect(),
            raw_response_type: raw.raw_response_type,
            response_mode: String::new(),
            client_id: raw.client_id,
            redirect_uri: Url::parse(&raw.raw_redirect_uri).ok(),
            state: raw.state,
            nonce: String::new(),
            prompts: prompts.iter().map(|s| s.to_string()).collect(),
            id_token_hint: None,
            id_token_hint_subject: None,
            max_age_secs: None,
            claims: None,
            request_uri: String::new(),
            registration: String::new(),
            use_fragment: false,
            flow: Some(Flow::Code),
        }
    }

    fn db() -> Arc<Database> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(Database::with_path(dir.path().join("t.db")).unwrap())
    }

    #[tokio::test]
    async fn authenticate_without_logon_cookie_redirects_to_sign_in() {
        let manager = LogonCookieIdentityManager::new(db(), "cookie");
        let ar = bare_ar(&[]);
        let jar = CookieJar::new();
        let cookies = CookieStore::new(&[1u8; 32]).unwrap();
        let sign_in_uri = Url::parse("https://idp.example.com/signin").unwrap();
        let ctx = AuthenticateContext {
            ar: &ar,
            cookie_jar: &jar,
            cookies: &cookies,
            sign_in_uri: &sign_in_uri,
            raw_query: "client_id=c1",
            client_allows_guest: false,
        };
        let outcome = manager.authenticate(&ctx).await.unwrap();
        match outcome {
            Outcome::Handled { redirect_to, .. } => {
                assert!(redirect_to.as_str().contains("flow=oidc"));
            }
            _ => panic!("expected a redirect"),
        }
    }

    #[tokio::test]
    async fn authenticate_with_prompt_none_and_no_session_fails_login_required() {
        let manager = LogonCookieIdentityManager::new(db(), "cookie");
        let ar = bare_ar(&["none"]);
        let jar = CookieJar::new();
        let cookies = CookieStore::new(&[1u8; 32]).unwrap();
        let sign_in_uri = Url::parse("https://idp.example.com/signin").unwrap();
        let ctx = AuthenticateContext {
            ar: &ar,
            cookie_jar: &jar,
            cookies: &cookies,
            sign_in_uri: &sign_in_uri,
            raw_query: "",
            client_allows_guest: false,
        };
        let outcome = manager.authenticate(&ctx).await.unwrap();
        match outcome {
            Outcome::Failed(err) => assert_eq!(err.error_id, crate::oidc::ar::error_id::LOGIN_REQUIRED),
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn authorize_untrusted_client_without_consent_cookie_redirects_to_consent() {
        let manager = LogonCookieIdentityManager::new(db(), "cookie");
        let ar = bare_ar(&[]);
        let jar = CookieJar::new();
        let cookies = CookieStore::new(&[1u8; 32]).unwrap();
        let sign_in_uri = Url::parse("https://idp.example.com/signin").unwrap();
        let ctx = AuthorizeContext {
            ar: &ar,
            cookie_jar: &jar,
            cookies: &cookies,
            sign_in_uri: &sign_in_uri,
            raw_query: "",
            client_trusted: false,
        };
        let auth = AuthRecord { subject: "alice".into(), auth_time: 0, claims: Default::default() };
        let outcome = manager.authorize(&ctx, &auth).await.unwrap();
        match outcome {
            Outcome::Handled { redirect_to, .. } => assert!(redirect_to.as_str().contains("flow=consent")),
            _ => panic!("expected a redirect to the consent prompt"),
        }
    }

    #[tokio::test]
    async fn authorize_trusted_client_drops_offline_access_without_explicit_consent() {
        let manager = LogonCookieIdentityManager::new(db(), "cookie");
        let mut ar = bare_ar(&[]);
        ar.scopes.insert(SCOPE_OFFLINE_ACCESS.to_string());
        let jar = CookieJar::new();
        let cookies = CookieStore::new(&[1u8; 32]).unwrap();
        let sign_in_uri = Url::parse("https://idp.example.com/signin").unwrap();
        let ctx = AuthorizeContext {
            ar: &ar,
            cookie_jar: &jar,
            cookies: &cookies,
            sign_in_uri: &sign_in_uri,
            raw_query: "",
            client_trusted: true,
        };
        let auth = AuthRecord { subject: "alice".into(), auth_time: 0, claims: Default::default() };
        let outcome = manager.authorize(&ctx, &auth).await.unwrap();
        match outcome {
            Outcome::Continue(decision) => assert!(!decision.approved_scopes.contains(SCOPE_OFFLINE_ACCESS)),
            _ => panic!("expected the request to continue"),
        }
    }
}
