//! Adapts the Provider orchestrator's HTTP-framework-agnostic return values
//! to real axum `Response`s. Grounded on
//! `examples/vpopescu-ark-mcp/src/server/handlers/oauth.rs`'s extractor
//! and `error_redirect` idiom, and on its `health.rs` for the liveness /
//! readiness handlers (content negotiation via `Accept`).

use std::sync::Arc;

use axum::extract::{OriginalUri, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{Html, IntoResponse, Json, Redirect, Response};
use axum::Form;
use axum_extra::extract::cookie::CookieJar;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::oidc::ar::{AuthenticationError, RawAuthenticationRequest, error_id};
use crate::oidc::clients::ClientDetails;
use crate::oidc::provider::{AuthorizeOutcome, Provider, TokenSuccess, build_redirect_url};
use crate::state::LifecycleState;

// ---------------- Discovery / JWKS ----------------

pub async fn discovery(State(provider): State<Arc<Provider>>) -> impl IntoResponse {
    Json(provider.metadata().clone())
}

pub async fn jwks(State(provider): State<Arc<Provider>>) -> impl IntoResponse {
    Json(provider.jwks())
}

pub async fn check_session(State(provider): State<Arc<Provider>>) -> impl IntoResponse {
    Html(provider.check_session_html())
}

// ---------------- Authorization endpoint ----------------

pub async fn authorize_get(State(provider): State<Arc<Provider>>, OriginalUri(uri): OriginalUri, jar: CookieJar, Query(raw): Query<RawAuthenticationRequest>) -> Response {
    let raw_query = uri.query().unwrap_or_default();
    let outcome = provider.handle_authorize(raw, raw_query, &jar).await;
    render_authorize_outcome(outcome)
}

pub async fn authorize_post(State(provider): State<Arc<Provider>>, OriginalUri(uri): OriginalUri, jar: CookieJar, Form(raw): Form<RawAuthenticationRequest>) -> Response {
    let raw_query = uri.query().unwrap_or_default();
    let outcome = provider.handle_authorize(raw, raw_query, &jar).await;
    render_authorize_outcome(outcome)
}

fn render_authorize_outcome(outcome: AuthorizeOutcome) -> Response {
    match outcome {
        AuthorizeOutcome::BadRequest(err) => (StatusCode::BAD_REQUEST, Json(err)).into_response(),
        AuthorizeOutcome::Redirect { target, params, use_fragment, form_post, set_cookies } => {
            let mut jar = CookieJar::new();
            for cookie in set_cookies {
                jar = jar.add(cookie);
            }
            if form_post {
                (jar, Html(form_post_html(&target, &params))).into_response()
            } else {
                let url = if params.is_empty() { target } else { build_redirect_url(&target, &params, use_fragment) };
                (jar, Redirect::to(url.as_str())).into_response()
            }
        }
    }
}

fn form_post_html(target: &url::Url, params: &[(String, String)]) -> String {
    let mut action = target.clone();
    action.set_query(None);
    action.set_fragment(None);
    let inputs: String = params.iter().map(|(k, v)| format!("<input type=\"hidden\" name=\"{}\" value=\"{}\">\n", html_escape(k), html_escape(v))).collect();
    format!(
        "<!DOCTYPE html>\n<html><head><title>Continue</title></head>\n<body onload=\"document.forms[0].submit()\">\n<form method=\"post\" action=\"{}\">\n{}<noscript><input type=\"submit\" value=\"Continue\"></noscript>\n</form>\n</body></html>\n",
        html_escape(action.as_str()),
        inputs
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

// ---------------- Token endpoint ----------------

#[derive(Debug, Default, Deserialize)]
pub struct TokenRequest {
    #[serde(default)]
    grant_type: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    redirect_uri: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
}

#[derive(Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
    expires_in: i64,
    scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    id_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
}

impl From<TokenSuccess> for TokenResponse {
    fn from(s: TokenSuccess) -> Self {
        TokenResponse { access_token: s.access_token, token_type: s.token_type, expires_in: s.expires_in, scope: s.scope, id_token: s.id_token, refresh_token: s.refresh_token }
    }
}

pub async fn token(State(provider): State<Arc<Provider>>, headers: HeaderMap, Form(req): Form<TokenRequest>) -> Response {
    let (client_id, client_secret) = match basic_auth_credentials(&headers) {
        Some((id, secret)) => (Some(id), Some(secret)),
        None => (req.client_id.clone(), req.client_secret.clone()),
    };
    let Some(client_id) = client_id.filter(|s| !s.is_empty()) else {
        return token_error(StatusCode::BAD_REQUEST, error_id::INVALID_CLIENT, "missing client_id");
    };

    let result = match req.grant_type.as_str() {
        "authorization_code" => match req.code.as_deref().filter(|s| !s.is_empty()) {
            Some(code) => provider.handle_authorization_code_grant(code, &client_id, client_secret.as_deref(), req.redirect_uri.as_deref()).await,
            None => return token_error(StatusCode::BAD_REQUEST, error_id::INVALID_REQUEST, "missing code"),
        },
        "refresh_token" => match req.refresh_token.as_deref().filter(|s| !s.is_empty()) {
            Some(refresh_token) => provider.handle_refresh_token_grant(refresh_token, &client_id, client_secret.as_deref()).await,
            None => return token_error(StatusCode::BAD_REQUEST, error_id::INVALID_REQUEST, "missing refresh_token"),
        },
        other => return token_error(StatusCode::BAD_REQUEST, "unsupported_grant_type", &format!("unsupported grant_type {other}")),
    };

    match result {
        Ok(success) => {
            crate::metrics::record_token_issued(&req.grant_type);
            (no_store_headers(), Json(TokenResponse::from(success))).into_response()
        }
        Err(err) => {
            let status = if err.error_id == error_id::INVALID_CLIENT { StatusCode::UNAUTHORIZED } else { StatusCode::BAD_REQUEST };
            (status, Json(err)).into_response()
        }
    }
}

fn no_store_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CACHE_CONTROL, "no-store".parse().unwrap());
    headers.insert(header::PRAGMA, "no-cache".parse().unwrap());
    headers
}

fn token_error(status: StatusCode, error_id: &str, description: &str) -> Response {
    (status, Json(AuthenticationError { error_id: error_id.to_string(), error_description: Some(description.to_string()), state: None })).into_response()
}

/// Parses RFC 7617 `Authorization: Basic <base64(id:secret)>`, percent-
/// decoding each half per RFC 6749 appendix B.
fn basic_auth_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    use base64::Engine as _;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((urlencoding::decode(user).ok()?.into_owned(), urlencoding::decode(pass).ok()?.into_owned()))
}

// ---------------- Userinfo endpoint ----------------

pub async fn userinfo(State(provider): State<Arc<Provider>>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        return unauthorized(error_id::INVALID_TOKEN, "missing bearer token");
    };
    match provider.handle_userinfo(&token).await {
        Ok(claims) => Json(claims).into_response(),
        Err(err) => unauthorized(&err.error_id, err.error_description.as_deref().unwrap_or_default()),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::to_string)
}

fn unauthorized(error_id: &str, description: &str) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::WWW_AUTHENTICATE, format!("Bearer error=\"{error_id}\", error_description=\"{description}\"").parse().unwrap());
    (StatusCode::UNAUTHORIZED, headers, Json(AuthenticationError { error_id: error_id.to_string(), error_description: Some(description.to_string()), state: None })).into_response()
}

// ---------------- RP-initiated logout ----------------

#[derive(Debug, Default, Deserialize)]
pub struct EndSessionRequest {
    #[serde(default)]
    post_logout_redirect_uri: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

pub async fn end_session_get(State(provider): State<Arc<Provider>>, Query(req): Query<EndSessionRequest>) -> Response {
    render_end_session(&provider, req)
}

pub async fn end_session_post(State(provider): State<Arc<Provider>>, Form(req): Form<EndSessionRequest>) -> Response {
    render_end_session(&provider, req)
}

fn render_end_session(provider: &Provider, req: EndSessionRequest) -> Response {
    let (mut target, cookies) = provider.handle_end_session(req.post_logout_redirect_uri.as_deref());
    if let Some(state) = req.state.filter(|s| !s.is_empty()) {
        target.query_pairs_mut().append_pair("state", &state);
    }
    let mut jar = CookieJar::new();
    for cookie in cookies {
        jar = jar.add(cookie);
    }
    (jar, Redirect::to(target.as_str())).into_response()
}

// ---------------- Dynamic client registration ----------------

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    redirect_uris: Vec<String>,
    #[serde(default)]
    client_name: Option<String>,
}

pub async fn register(State(provider): State<Arc<Provider>>, Json(req): Json<RegisterRequest>) -> Response {
    match provider.handle_register(req.redirect_uris, req.client_name).await {
        Ok(client) => (StatusCode::CREATED, Json(client_registration_response(&client))).into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid_client_metadata", "error_description": err.to_string() }))).into_response(),
    }
}

fn client_registration_response(client: &ClientDetails) -> serde_json::Value {
    json!({
        "client_id": client.client_id,
        "client_secret": client.client_secret,
        "redirect_uris": client.redirect_uris,
        "client_name": client.client_name,
    })
}

// ---------------- Health ----------------

pub async fn livez(State(lifecycle): State<Arc<LifecycleState>>, headers: HeaderMap) -> Response {
    respond_health(headers, lifecycle.is_alive(), "live", "not live")
}

pub async fn readyz(State(lifecycle): State<Arc<LifecycleState>>, headers: HeaderMap) -> Response {
    respond_health(headers, lifecycle.is_ready(), "ready", "not ready")
}

fn respond_health(headers: HeaderMap, healthy: bool, ok_text: &'static str, bad_text: &'static str) -> Response {
    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()).unwrap_or("");
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    let text = if healthy { ok_text } else { bad_text };
    if accept.contains("application/json") {
        (status, Json(json!({ "status": text }))).into_response()
    } else {
        (status, text).into_response()
    }
}

#[cfg(feature = "prometheus")]
pub async fn metrics() -> Response {
    match crate::metrics::render() {
        Some(body) => (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
