//! Command-line surface. Mirrors `bootstrap.go`'s cobra flag set one-to-one,
//! translated into a `clap::Parser` derive the way the teacher's own
//! `main.rs` does for its (much smaller) flag set.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
#[clap(rename_all = "lower")]
pub enum IdentityManagerName {
    Cookie,
    Dummy,
    Kc,
    Ldap,
}

impl std::fmt::Display for IdentityManagerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IdentityManagerName::Cookie => "cookie",
            IdentityManagerName::Dummy => "dummy",
            IdentityManagerName::Kc => "kc",
            IdentityManagerName::Ldap => "ldap",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
#[clap(rename_all = "UPPER")]
pub enum SigningMethod {
    #[default]
    PS256,
    PS384,
    PS512,
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
    ES512,
    EdDSA,
}

impl SigningMethod {
    /// Maps to the `jsonwebtoken` algorithm, or `None` for `ES512`: the
    /// underlying P-521 curve has no supported implementation in
    /// `jsonwebtoken`'s `rust_crypto` backend. Rejected at KeySet
    /// construction rather than panicking here.
    pub fn to_jsonwebtoken(self) -> Option<jsonwebtoken::Algorithm> {
        use jsonwebtoken::Algorithm;
        Some(match self {
            SigningMethod::PS256 => Algorithm::PS256,
            SigningMethod::PS384 => Algorithm::PS384,
            SigningMethod::PS512 => Algorithm::PS512,
            SigningMethod::RS256 => Algorithm::RS256,
            SigningMethod::RS384 => Algorithm::RS384,
            SigningMethod::RS512 => Algorithm::RS512,
            SigningMethod::ES256 => Algorithm::ES256,
            SigningMethod::ES384 => Algorithm::ES384,
            SigningMethod::ES512 => return None,
            SigningMethod::EdDSA => Algorithm::EdDSA,
        })
    }

    pub fn is_rsa_family(self) -> bool {
        matches!(
            self,
            SigningMethod::PS256
                | SigningMethod::PS384
                | SigningMethod::PS512
                | SigningMethod::RS256
                | SigningMethod::RS384
                | SigningMethod::RS512
        )
    }
}

impl std::fmt::Display for SigningMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SigningMethod::PS256 => "PS256",
            SigningMethod::PS384 => "PS384",
            SigningMethod::PS512 => "PS512",
            SigningMethod::RS256 => "RS256",
            SigningMethod::RS384 => "RS384",
            SigningMethod::RS512 => "RS512",
            SigningMethod::ES256 => "ES256",
            SigningMethod::ES384 => "ES384",
            SigningMethod::ES512 => "ES512",
            SigningMethod::EdDSA => "EdDSA",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
#[clap(rename_all = "lower")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "idpd",
    version,
    about = "OpenID Connect 1.0 / OAuth 2.0 identity provider",
    long_about = None
)]
pub struct Args {
    /// Identity manager backend to bind to this instance.
    #[arg(value_enum)]
    pub identity_manager: IdentityManagerName,

    /// Optional YAML file supplying defaults for any flag below.
    #[arg(long = "config-file", env = "KONNECTD_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Log verbosity. `RUST_LOG`, when set, takes precedence.
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Issuer identifier URL. Must be `https` with a non-empty host.
    #[arg(long = "iss", env = "KONNECTD_ISS")]
    pub iss: Option<String>,

    /// Path prefix under which the konnect/v1 endpoint tree is mounted.
    #[arg(long = "uri-base-path", env = "KONNECTD_URI_BASE_PATH", default_value = "")]
    pub uri_base_path: String,

    #[arg(long = "sign-in-uri", env = "KONNECTD_SIGN_IN_URI")]
    pub sign_in_uri: Option<String>,

    #[arg(long = "signed-out-uri", env = "KONNECTD_SIGNED_OUT_URI")]
    pub signed_out_uri: Option<String>,

    #[arg(long = "authorization-endpoint-uri", env = "KONNECTD_AUTHORIZATION_ENDPOINT_URI")]
    pub authorization_endpoint_uri: Option<String>,

    #[arg(long = "endsession-endpoint-uri", env = "KONNECTD_ENDSESSION_ENDPOINT_URI")]
    pub endsession_endpoint_uri: Option<String>,

    /// Skip TLS verification on outbound calls. Never enable in production.
    #[arg(long = "insecure", env = "KONNECTD_INSECURE", default_value_t = false)]
    pub insecure: bool,

    /// Allow unsigned (`alg=none`) Request Objects. Off by default; see
    /// DESIGN.md's resolution of the "Request Object verification" open
    /// question.
    #[arg(
        long = "allow-unsigned-request-objects",
        env = "KONNECTD_ALLOW_UNSIGNED_REQUEST_OBJECTS",
        default_value_t = false
    )]
    pub allow_unsigned_request_objects: bool,

    /// Trusted reverse-proxy IPs/CIDRs; repeatable.
    #[arg(long = "trusted-proxy", env = "KONNECTD_TRUSTED_PROXY", value_delimiter = ',')]
    pub trusted_proxy: Vec<String>,

    /// Additional scopes recognized beyond the built-in set; repeatable.
    #[arg(long = "allow-scope", env = "KONNECTD_ALLOW_SCOPE", value_delimiter = ',')]
    pub allow_scope: Vec<String>,

    #[arg(long = "allow-client-guests", env = "KONNECTD_ALLOW_CLIENT_GUESTS", default_value_t = false)]
    pub allow_client_guests: bool,

    #[arg(
        long = "allow-dynamic-client-registration",
        env = "KONNECTD_ALLOW_DYNAMIC_CLIENT_REGISTRATION",
        default_value_t = false
    )]
    pub allow_dynamic_client_registration: bool,

    /// Path to a 32-byte file used as the AEAD cookie-encryption secret.
    #[arg(long = "encryption-secret", env = "KONNECTD_ENCRYPTION_SECRET")]
    pub encryption_secret: Option<PathBuf>,

    #[arg(long = "listen", env = "KONNECTD_LISTEN", default_value = "127.0.0.1:8777")]
    pub listen: String,

    #[arg(long = "identifier-client-path", env = "KONNECTD_IDENTIFIER_CLIENT_PATH")]
    pub identifier_client_path: Option<PathBuf>,

    #[arg(long = "identifier-registration-conf", env = "KONNECTD_IDENTIFIER_REGISTRATION_CONF")]
    pub identifier_registration_conf: Option<PathBuf>,

    #[arg(long = "identifier-scopes-conf", env = "KONNECTD_IDENTIFIER_SCOPES_CONF")]
    pub identifier_scopes_conf: Option<PathBuf>,

    #[arg(long = "signing-method", value_enum, env = "KONNECTD_SIGNING_METHOD", default_value_t = SigningMethod::PS256)]
    pub signing_method: SigningMethod,

    #[arg(long = "signing-kid", env = "KONNECTD_SIGNING_KID", default_value = "")]
    pub signing_kid: String,

    /// Paths to PEM private keys; repeatable. The first is also registered
    /// under `signing-kid` (see KeySet grounding in DESIGN.md).
    #[arg(long = "signing-private-key", env = "KONNECTD_SIGNING_PRIVATE_KEY", value_delimiter = ' ')]
    pub signing_private_key: Vec<PathBuf>,

    /// Directory scanned for PEM public keys; `kid` is the filename stem.
    #[arg(long = "validation-keys-path", env = "KONNECTD_VALIDATION_KEYS_PATH")]
    pub validation_keys_path: Option<PathBuf>,
}
