//! Discovery document served at `/.well-known/openid-configuration`, built
//! once by `Provider::initialize_metadata` from the Key Set, the identity
//! manager's supported scopes/claims, and enabled features, then served
//! lock-free thereafter (§5's "Discovery metadata: initialized once;
//! subsequent reads lock-free").

use serde::Serialize;
use url::Url;

use crate::oidc::keyset::KeySet;

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    pub jwks_uri: String,
    pub end_session_endpoint: String,
    pub check_session_iframe: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<String>,
    pub scopes_supported: Vec<String>,
    pub claims_supported: Vec<String>,
    pub response_types_supported: Vec<&'static str>,
    pub response_modes_supported: Vec<&'static str>,
    pub grant_types_supported: Vec<&'static str>,
    pub subject_types_supported: Vec<&'static str>,
    pub id_token_signing_alg_values_supported: Vec<String>,
    pub request_parameter_supported: bool,
    pub request_uri_parameter_supported: bool,
}

/// Parameters needed to build the document; gathered by `Provider` once its
/// identity manager is attached.
pub struct DiscoveryInputs<'a> {
    pub issuer: &'a Url,
    pub authorization_endpoint: &'a Url,
    pub token_endpoint: &'a Url,
    pub userinfo_endpoint: &'a Url,
    pub jwks_uri: &'a Url,
    pub end_session_endpoint: &'a Url,
    pub check_session_iframe: &'a Url,
    pub registration_endpoint: Option<&'a Url>,
    pub scopes_supported: Vec<String>,
    pub claims_supported: Vec<String>,
    pub keyset: &'a KeySet,
}

pub fn build(inputs: DiscoveryInputs<'_>) -> DiscoveryDocument {
    DiscoveryDocument {
        issuer: inputs.issuer.as_str().trim_end_matches('/').to_string(),
        authorization_endpoint: inputs.authorization_endpoint.to_string(),
        token_endpoint: inputs.token_endpoint.to_string(),
        userinfo_endpoint: inputs.userinfo_endpoint.to_string(),
        jwks_uri: inputs.jwks_uri.to_string(),
        end_session_endpoint: inputs.end_session_endpoint.to_string(),
        check_session_iframe: inputs.check_session_iframe.to_string(),
        registration_endpoint: inputs.registration_endpoint.map(Url::to_string),
        scopes_supported: inputs.scopes_supported,
        claims_supported: inputs.claims_supported,
        response_types_supported: vec!["code", "id_token", "id_token token", "code id_token", "code token", "code id_token token", "token"],
        response_modes_supported: vec!["query", "fragment", "form_post"],
        grant_types_supported: vec!["authorization_code", "refresh_token", "implicit"],
        subject_types_supported: vec!["public"],
        id_token_signing_alg_values_supported: vec![format!("{:?}", inputs.keyset.default_algorithm())],
        request_parameter_supported: true,
        request_uri_parameter_supported: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuer_is_trimmed_of_trailing_slash() {
        let issuer = Url::parse("https://idp.example.com/").unwrap();
        let same = issuer.clone();
        let doc = DiscoveryDocument {
            issuer: issuer.as_str().trim_end_matches('/').to_string(),
            authorization_endpoint: String::new(),
            token_endpoint: String::new(),
            userinfo_endpoint: String::new(),
            jwks_uri: String::new(),
            end_session_endpoint: String::new(),
            check_session_iframe: String::new(),
            registration_endpoint: None,
            scopes_supported: vec![],
            claims_supported: vec![],
            response_types_supported: vec![],
            response_modes_supported: vec![],
            grant_types_supported: vec![],
            subject_types_supported: vec![],
            id_token_signing_alg_values_supported: vec![],
            request_parameter_supported: true,
            request_uri_parameter_supported: false,
        };
        assert_eq!(doc.issuer, "https://idp.example.com");
        let _ = same;
    }
}
