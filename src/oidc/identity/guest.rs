//! Guest decorator: wraps another `IdentityManager` and, for clients
//! flagged to allow guest access, substitutes an ephemeral anonymous
//! identity instead of bouncing the user to the external sign-in UI.
//! Grounded on the bootstrap's `setupGuest`, constructed only when
//! `--allow-client-guests` is set.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use rand::RngCore;

use crate::oidc::identity::{AuthRecord, AuthenticateContext, AuthorizeContext, AuthorizeDecision, IdentityManager, Outcome};

pub struct GuestIdentityManager {
    inner: Arc<dyn IdentityManager>,
}

impl GuestIdentityManager {
    pub fn new(inner: Arc<dyn IdentityManager>) -> Self {
        GuestIdentityManager { inner }
    }

    fn synthesize_guest() -> AuthRecord {
        let mut buf = [0u8; 12];
        rand::rng().fill_bytes(&mut buf);
        AuthRecord {
            subject: format!("guest-{}", hex::encode(buf)),
            auth_time: crate::oidc::cookies::now_epoch(),
            claims: Default::default(),
        }
    }
}

#[async_trait]
impl IdentityManager for GuestIdentityManager {
    async fn authenticate(&self, ctx: &AuthenticateContext<'_>) -> anyhow::Result<Outcome<AuthRecord>> {
        if !ctx.client_allows_guest {
            return self.inner.authenticate(ctx).await;
        }

        match self.inner.authenticate(ctx).await? {
            Outcome::Continue(auth) => Ok(Outcome::Continue(auth)),
            Outcome::Handled { .. } | Outcome::Failed(_) => Ok(Outcome::Continue(Self::synthesize_guest())),
        }
    }

    async fn authorize(&self, ctx: &AuthorizeContext<'_>, auth: &AuthRecord) -> anyhow::Result<Outcome<AuthorizeDecision>> {
        if auth.subject.starts_with("guest-") {
            return Ok(Outcome::Continue(AuthorizeDecision { approved_scopes: ctx.ar.scopes.clone() }));
        }
        self.inner.authorize(ctx, auth).await
    }

    async fn approve_scopes(&self, auth: &AuthRecord, audience: &str, scopes: &BTreeSet<String>) -> anyhow::Result<String> {
        self.inner.approve_scopes(auth, audience, scopes).await
    }

    async fn approved_scopes(&self, auth: &AuthRecord, audience: &str, reference: &str) -> anyhow::Result<Option<BTreeSet<String>>> {
        self.inner.approved_scopes(auth, audience, reference).await
    }

    async fn fetch(
        &self,
        subject: &str,
        claims: &serde_json::Map<String, serde_json::Value>,
        scopes: &BTreeSet<String>,
    ) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
        if subject.starts_with("guest-") {
            return Ok(Default::default());
        }
        self.inner.fetch(subject, claims, scopes).await
    }

    fn scopes_supported(&self) -> Vec<String> {
        self.inner.scopes_supported()
    }

    fn claims_supported(&self) -> Vec<String> {
        self.inner.claims_supported()
    }

    fn name(&self) -> &'static str {
        "guest"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oidc::ar::{Ar, Flow};
    use crate::oidc::cookies::CookieStore;
    use crate::oidc::identity::login_required;
    use axum_extra::extract::cookie::CookieJar;
    use url::Url;

    struct AlwaysFailsManager;

    #[async_trait]
    impl IdentityManager for AlwaysFailsManager {
        async fn authenticate(&self, ctx: &AuthenticateContext<'_>) -> anyhow::Result<Outcome<AuthRecord>> {
            Ok(Outcome::Failed(login_required(ctx.ar)))
        }
        async fn authorize(&self, ctx: &AuthorizeContext<'_>, _auth: &AuthRecord) -> anyhow::Result<Outcome<AuthorizeDecision>> {
            Ok(Outcome::Continue(AuthorizeDecision { approved_scopes: ctx.ar.scopes.clone() }))
        }
        async fn approve_scopes(&self, _auth: &AuthRecord, _audience: &str, _scopes: &BTreeSet<String>) -> anyhow::Result<String> {
            Ok(String::new())
        }
        async fn approved_scopes(&self, _auth: &AuthRecord, _audience: &str, _reference: &str) -> anyhow::Result<Option<BTreeSet<String>>> {
            Ok(None)
        }
        async fn fetch(&self, _subject: &str, _claims: &serde_json::Map<String, serde_json::Value>, _scopes: &BTreeSet<String>) -> anyhow::Result<serde_json::Map<String, serde_json::Value>> {
            Ok(Default::default())
        }
        fn scopes_supported(&self) -> Vec<String> {
            Vec::new()
        }
        fn claims_supported(&self) -> Vec<String> {
            Vec::new()
        }
        fn name(&self) -> &'static str {
            "always-fails"
        }
    }

    fn bare_ar() -> Ar {
        Ar {
            scopes: ["openid"].into_iter().map(str::to_string).collect(),
            response_types: ["code"].into_iter().map(str::to_string).collect(),
            raw_response_type: "code".into(),
            response_mode: String::new(),
            client_id: "c1".into(),
            redirect_uri: Url::parse("https://rp/cb").ok(),
            state: "s1".into(),
            nonce: String::new(),
            prompts: Default::default(),
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

    #[tokio::test]
    async fn falls_back_to_guest_identity_when_client_allows_it() {
        let guest = GuestIdentityManager::new(Arc::new(AlwaysFailsManager));
        let ar = bare_ar();
        let jar = CookieJar::new();
        let cookies = CookieStore::new(&[1u8; 32]).unwrap();
        let sign_in_uri = Url::parse("https://idp.example.com/signin").unwrap();
        let ctx = AuthenticateContext {
            ar: &ar,
            cookie_jar: &jar,
            cookies: &cookies,
            sign_in_uri: &sign_in_uri,
            raw_query: "",
            client_allows_guest: true,
        };
        let outcome = guest.authenticate(&ctx).await.unwrap();
        match outcome {
            Outcome::Continue(auth) => assert!(auth.subject.starts_with("guest-")),
            _ => panic!("expected a synthesized guest identity"),
        }
    }

    #[tokio::test]
    async fn passes_through_when_client_does_not_allow_guests() {
        let guest = GuestIdentityManager::new(Arc::new(AlwaysFailsManager));
        let ar = bare_ar();
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
        let outcome = guest.authenticate(&ctx).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(_)));
    }
}
