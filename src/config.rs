//! Runtime configuration: CLI/env via [`crate::cli::Args`], optionally
//! layered on top of a YAML defaults file the way the teacher's
//! `config::load_with_overrides` layers CLI flags over a parsed YAML file,
//! with CLI/env still winning. See DESIGN.md's "Bootstrap / CLI" entry.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::cli::{Args, SigningMethod};

/// Default bind address, mirrors the Go original's `defaultListenAddr`.
const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8777";
/// Default identifier client static asset path.
const DEFAULT_IDENTIFIER_CLIENT_PATH: &str = "./identifier-webapp";
/// Access tokens are always minted with this fixed lifetime (§4.6).
pub const ACCESS_TOKEN_DURATION: Duration = Duration::from_secs(10 * 60);
/// AES-256-GCM key size, also the required length of the encryption secret
/// file loaded via `--encryption-secret`.
pub const ENCRYPTION_KEY_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config file {0}: {1}")]
    Parse(PathBuf, String),

    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("invalid iss value: {0}")]
    InvalidIssuer(String),

    #[error("failed to load encryption secret from {0}: {1}")]
    EncryptionSecret(PathBuf, String),

    #[error("invalid encryption secret size in {0} - must be {1} bytes")]
    EncryptionSecretSize(PathBuf, usize),

    #[error("identity-manager argument missing, use one of kc, ldap, cookie, dummy")]
    MissingIdentityManager,

    #[error("{0} file not found or unable to access: {1}")]
    FileNotFound(&'static str, std::io::Error),

    #[error("unknown signing method: {0}")]
    UnknownSigningMethod(String),
}

/// Optional on-disk defaults, applied beneath CLI/env overrides. Every field
/// is optional and mirrors a flag in [`Args`].
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct FileDefaults {
    iss: Option<String>,
    uri_base_path: Option<String>,
    sign_in_uri: Option<String>,
    signed_out_uri: Option<String>,
    authorization_endpoint_uri: Option<String>,
    endsession_endpoint_uri: Option<String>,
    insecure: Option<bool>,
    allow_unsigned_request_objects: Option<bool>,
    trusted_proxy: Option<Vec<String>>,
    allow_scope: Option<Vec<String>>,
    allow_client_guests: Option<bool>,
    allow_dynamic_client_registration: Option<bool>,
    encryption_secret: Option<PathBuf>,
    listen: Option<String>,
    identifier_client_path: Option<PathBuf>,
    identifier_registration_conf: Option<PathBuf>,
    identifier_scopes_conf: Option<PathBuf>,
    signing_kid: Option<String>,
    validation_keys_path: Option<PathBuf>,
}

fn parse_yaml_with_path(path: &Path) -> Result<FileDefaults, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
    serde_yaml_ng::from_str(&raw).map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
}

/// Fully resolved configuration, produced by merging an optional YAML file
/// beneath CLI/env [`Args`] (CLI/env always wins — same precedence rule as
/// the teacher's `load_with_overrides`).
#[derive(Debug, Clone)]
pub struct Config {
    pub issuer: Url,
    pub uri_base_path: String,
    pub sign_in_uri: Option<Url>,
    pub signed_out_uri: Option<Url>,
    pub authorization_endpoint_uri: Option<Url>,
    pub endsession_endpoint_uri: Option<Url>,
    pub insecure: bool,
    pub allow_unsigned_request_objects: bool,
    pub trusted_proxies: Vec<String>,
    pub allowed_scopes: Vec<String>,
    pub allow_client_guests: bool,
    pub allow_dynamic_client_registration: bool,
    pub encryption_secret: Vec<u8>,
    pub listen: String,
    pub identifier_client_path: PathBuf,
    pub identifier_registration_conf: Option<PathBuf>,
    pub identifier_scopes_conf: Option<PathBuf>,
    pub signing_method: SigningMethod,
    pub signing_kid: String,
    pub signing_private_keys: Vec<PathBuf>,
    pub validation_keys_path: Option<PathBuf>,
    pub identity_manager: crate::cli::IdentityManagerName,
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let defaults = match &args.config_file {
            Some(path) => parse_yaml_with_path(path)?,
            None => FileDefaults::default(),
        };

        let iss = args.iss.clone().or(defaults.iss).unwrap_or_default();
        let issuer = Url::parse(&iss).map_err(|e| ConfigError::InvalidIssuer(e.to_string()))?;
        if issuer.scheme() != "https" {
            return Err(ConfigError::InvalidIssuer(
                "URL must start with https://".into(),
            ));
        }
        if issuer.host_str().is_none_or(str::is_empty) {
            return Err(ConfigError::InvalidIssuer("URL must have a host".into()));
        }

        let parse_opt_url = |s: Option<String>| -> Option<Url> {
            s.filter(|s| !s.is_empty()).and_then(|s| Url::parse(&s).ok())
        };

        let encryption_secret_path = args
            .encryption_secret
            .clone()
            .or(defaults.encryption_secret);
        let encryption_secret = match encryption_secret_path {
            Some(path) => {
                let bytes = fs::read(&path)
                    .map_err(|e| ConfigError::EncryptionSecret(path.clone(), e.to_string()))?;
                if bytes.len() != ENCRYPTION_KEY_SIZE {
                    return Err(ConfigError::EncryptionSecretSize(path, ENCRYPTION_KEY_SIZE));
                }
                tracing::info!(file = %path.display(), "loaded encryption secret from file");
                bytes
            }
            None => {
                tracing::warn!(
                    size = ENCRYPTION_KEY_SIZE,
                    "missing --encryption-secret parameter, using random encryption secret"
                );
                use rand::RngCore;
                let mut buf = vec![0u8; ENCRYPTION_KEY_SIZE];
                rand::rng().fill_bytes(&mut buf);
                buf
            }
        };

        let identifier_registration_conf = args
            .identifier_registration_conf
            .clone()
            .or(defaults.identifier_registration_conf);
        if let Some(path) = &identifier_registration_conf {
            fs::metadata(path).map_err(|e| ConfigError::FileNotFound("identifier-registration-conf", e))?;
        }

        let identifier_scopes_conf = args
            .identifier_scopes_conf
            .clone()
            .or(defaults.identifier_scopes_conf);
        if let Some(path) = &identifier_scopes_conf {
            fs::metadata(path).map_err(|e| ConfigError::FileNotFound("identifier-scopes-conf", e))?;
        }

        let mut allowed_scopes = if !args.allow_scope.is_empty() {
            args.allow_scope.clone()
        } else {
            defaults.allow_scope.unwrap_or_default()
        };
        if !allowed_scopes.is_empty() {
            tracing::info!(scopes = ?allowed_scopes, "using custom allowed OAuth 2 scopes");
        }
        allowed_scopes.sort();
        allowed_scopes.dedup();

        let signing_private_keys = if !args.signing_private_key.is_empty() {
            args.signing_private_key.clone()
        } else {
            Vec::new()
        };

        Ok(Config {
            issuer,
            uri_base_path: if !args.uri_base_path.is_empty() {
                args.uri_base_path.clone()
            } else {
                defaults.uri_base_path.unwrap_or_default()
            },
            sign_in_uri: parse_opt_url(args.sign_in_uri.clone().or(defaults.sign_in_uri)),
            signed_out_uri: parse_opt_url(args.signed_out_uri.clone().or(defaults.signed_out_uri)),
            authorization_endpoint_uri: parse_opt_url(
                args.authorization_endpoint_uri
                    .clone()
                    .or(defaults.authorization_endpoint_uri),
            ),
            endsession_endpoint_uri: parse_opt_url(
                args.endsession_endpoint_uri
                    .clone()
                    .or(defaults.endsession_endpoint_uri),
            ),
            insecure: args.insecure || defaults.insecure.unwrap_or(false),
            allow_unsigned_request_objects: args.allow_unsigned_request_objects
                || defaults.allow_unsigned_request_objects.unwrap_or(false),
            trusted_proxies: if !args.trusted_proxy.is_empty() {
                args.trusted_proxy.clone()
            } else {
                defaults.trusted_proxy.unwrap_or_default()
            },
            allowed_scopes,
            allow_client_guests: args.allow_client_guests
                || defaults.allow_client_guests.unwrap_or(false),
            allow_dynamic_client_registration: args.allow_dynamic_client_registration
                || defaults.allow_dynamic_client_registration.unwrap_or(false),
            encryption_secret,
            listen: {
                let listen = if args.listen != DEFAULT_LISTEN_ADDR {
                    args.listen.clone()
                } else {
                    defaults.listen.unwrap_or_else(|| args.listen.clone())
                };
                if listen.is_empty() {
                    DEFAULT_LISTEN_ADDR.to_string()
                } else {
                    listen
                }
            },
            identifier_client_path: args
                .identifier_client_path
                .clone()
                .or(defaults.identifier_client_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_IDENTIFIER_CLIENT_PATH)),
            identifier_registration_conf,
            identifier_scopes_conf,
            signing_method: args.signing_method,
            signing_kid: if !args.signing_kid.is_empty() {
                args.signing_kid.clone()
            } else {
                defaults.signing_kid.unwrap_or_default()
            },
            signing_private_keys,
            validation_keys_path: args
                .validation_keys_path
                .clone()
                .or(defaults.validation_keys_path),
            identity_manager: args.identity_manager,
        })
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Args, IdentityManagerName};
    use clap::Parser;

    fn base_args(iss: &str) -> Args {
        Args::parse_from(["idpd", "dummy", "--iss", iss])
    }

    #[test]
    fn rejects_non_https_issuer() {
        let args = base_args("http://example.com");
        let err = Config::load(&args).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidIssuer(_)));
    }

    #[test]
    fn rejects_empty_issuer() {
        let args = Args::parse_from(["idpd", "dummy"]);
        let err = Config::load(&args).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidIssuer(_)));
    }

    #[test]
    fn accepts_valid_https_issuer() {
        let args = base_args("https://idp.example.com");
        let cfg = Config::load(&args).unwrap();
        assert_eq!(cfg.issuer.as_str(), "https://idp.example.com/");
        assert_eq!(cfg.identity_manager, IdentityManagerName::Dummy);
        assert_eq!(cfg.encryption_secret.len(), ENCRYPTION_KEY_SIZE);
    }

    #[test]
    fn generates_random_encryption_secret_when_missing() {
        let args = base_args("https://idp.example.com");
        let a = Config::load(&args).unwrap();
        let b = Config::load(&args).unwrap();
        assert_ne!(a.encryption_secret, b.encryption_secret);
    }

    #[test]
    fn loads_encryption_secret_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("secret.bin");
        std::fs::write(&secret_path, [7u8; ENCRYPTION_KEY_SIZE]).unwrap();
        let args = Args::parse_from([
            "idpd",
            "dummy",
            "--iss",
            "https://idp.example.com",
            "--encryption-secret",
            secret_path.to_str().unwrap(),
        ]);
        let cfg = Config::load(&args).unwrap();
        assert_eq!(cfg.encryption_secret, vec![7u8; ENCRYPTION_KEY_SIZE]);
    }

    #[test]
    fn rejects_wrong_size_encryption_secret() {
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("secret.bin");
        std::fs::write(&secret_path, [7u8; 10]).unwrap();
        let args = Args::parse_from([
            "idpd",
            "dummy",
            "--iss",
            "https://idp.example.com",
            "--encryption-secret",
            secret_path.to_str().unwrap(),
        ]);
        let err = Config::load(&args).unwrap_err();
        assert!(matches!(err, ConfigError::EncryptionSecretSize(_, _)));
    }
}
