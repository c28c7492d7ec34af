//! `dummy` identity manager: always authenticates as a single static user,
//! never prompts. Intended for local development and the scenario tests in
//! SPEC_FULL §8, the same role the Go original's `dummy` backend plays.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::oidc::identity::{AuthRecord, AuthenticateContext, AuthorizeContext, AuthorizeDecision, IdentityManager, Outcome, filter_claims, persist_approve_scopes, persist_approved_scopes};
use crate::persist::Database;

const DUMMY_SUBJECT: &str = "dummy-user";

pub struct DummyIdentityManager {
    db: Arc<Database>,
}

impl DummyIdentityManager {
    pub fn new(db: Arc<Database>) -> Self {
        DummyIdentityManager { db }
    }

    fn claims() -> serde_json::Map<String, serde_json::Value> {
        match json!({ "name": "Dummy User", "email": "dummy-user@example.com" }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }
}

#[async_trait]
impl IdentityManager for DummyIdentityManager {
    async fn authenticate(&self, ctx: &AuthenticateContext<'_>) -> anyhow::Result<Outcome<AuthRecord>> {
        let _ = ctx;
        Ok(Outcome::Continue(AuthRecord {
            subject: DUMMY_SUBJECT.to_string(),
            auth_time: crate::oidc::cookies::now_epoch(),
            claims: Self::claims(),
        }))
    }

    async fn authorize(&self, ctx: &AuthorizeContext<'_>, auth: &AuthRecord) -> anyhow::Result<Outcome<AuthorizeDecision>> {
        let _ = auth;
        Ok(Outcome::Continue(AuthorizeDecision { approved_scopes: ctx.ar.scopes.clone() }))
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
        vec!["profile".into(), "email".into()]
    }

    fn claims_supported(&self) -> Vec<String> {
        vec!["name".into(), "email".into()]
    }

    fn name(&self) -> &'static str {
        "dummy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oidc::ar::{Ar, Flow};
    use crate::oidc::cookies::CookieStore;
    use axum_extra::extract::cookie::CookieJar;
    use url::Url;

    fn db() -> Arc<Database> {
        let dir = tempfile::tempdir().unwrap();
        Arc::new(Database::with_path(dir.path().join("t.db")).unwrap())
    }

    fn bare_ar() -> Ar {
        Ar {
            scopes: ["openid", "profile"].into_iter().map(str::to_string).collect(),
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
    async fn authenticate_always_succeeds() {
        let manager = DummyIdentityManager::new(db());
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
        let outcome = manager.authenticate(&ctx).await.unwrap();
        match outcome {
            Outcome::Continue(auth) => assert_eq!(auth.subject, DUMMY_SUBJECT),
            _ => panic!("dummy manager should always continue"),
        }
    }

    #[tokio::test]
    async fn authorize_approves_every_requested_scope() {
        let manager = DummyIdentityManager::new(db());
        let ar = bare_ar();
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
        let auth = AuthRecord { subject: DUMMY_SUBJECT.into(), auth_time: 0, claims: Default::default() };
        let outcome = manager.authorize(&ctx, &auth).await.unwrap();
        match outcome {
            Outcome::Continue(decision) => assert_eq!(decision.approved_scopes, ar.scopes),
            _ => panic!("dummy manager should never prompt for consent"),
        }
    }
}
