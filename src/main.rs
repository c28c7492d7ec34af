//! `idpd` entry point.
//!
//! Mirrors the bootstrap's `setupOIDCProvider` startup sequence: parse CLI
//! args, load configuration, load the Key Set, open the database, load the
//! client registry, construct the identity manager the operator selected
//! (wrapped in the guest decorator), attach it to the `Provider`, and serve.
//!
//! # Application lifecycle
//!
//! 1. **Initializing** — CLI/config parsed, logging installed.
//! 2. **LoadingKeys** — Key Set, database, client registry, identity manager
//!    and `Provider` constructed.
//! 3. **StartingNetwork** — router assembled, listener bound.
//! 4. **Ready** — serving.
//! 5. **Terminating** — graceful shutdown in progress.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use idpd::cli::{Args, IdentityManagerName};
use idpd::config::Config;
use idpd::oidc::clients::ClientRegistry;
use idpd::oidc::identity::IdentityManager;
use idpd::oidc::identity::cookie::LogonCookieIdentityManager;
use idpd::oidc::identity::dummy::DummyIdentityManager;
use idpd::oidc::identity::guest::GuestIdentityManager;
use idpd::oidc::keyset::KeySet;
use idpd::oidc::provider::Provider;
use idpd::persist::Database;
use idpd::state::{ApplicationState, LifecycleState};
use idpd::{metrics, service};

fn init_logging(args: &Args) {
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.to_string());
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(tracing_subscriber::filter::EnvFilter::new(env_filter))
        .init();
}

fn build_identity_manager(cfg: &Config, db: Arc<Database>) -> Arc<dyn IdentityManager> {
    let inner: Arc<dyn IdentityManager> = match cfg.identity_manager {
        IdentityManagerName::Dummy => Arc::new(DummyIdentityManager::new(db)),
        IdentityManagerName::Cookie => Arc::new(LogonCookieIdentityManager::new(db, "cookie")),
        IdentityManagerName::Kc => Arc::new(LogonCookieIdentityManager::new(db, "kc")),
        IdentityManagerName::Ldap => Arc::new(LogonCookieIdentityManager::new(db, "ldap")),
    };
    if cfg.allow_client_guests { Arc::new(GuestIdentityManager::new(inner)) } else { inner }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let lifecycle = Arc::new(LifecycleState::new());
    lifecycle.set(ApplicationState::Initializing);

    let cfg = Config::load(&args)?;

    rustls::crypto::aws_lc_rs::default_provider().install_default().expect("failed to install the aws-lc-rs rustls crypto provider");

    metrics::init();

    lifecycle.set(ApplicationState::LoadingKeys);

    let keyset = Arc::new(KeySet::from_config(&cfg)?);
    let db = Arc::new(Database::new()?);
    let clients = Arc::new(ClientRegistry::load(cfg.identifier_registration_conf.as_deref(), cfg.allow_dynamic_client_registration)?);

    let identity_manager = build_identity_manager(&cfg, db.clone());

    let provider = Arc::new(Provider::new(&cfg, keyset, db, clients)?);
    provider.attach_identity_manager(identity_manager);
    provider.initialize_metadata();

    lifecycle.set(ApplicationState::StartingNetwork);

    match service::start(&cfg, provider, lifecycle.clone()).await {
        Ok(()) => tracing::info!("server has exited"),
        Err(e) => tracing::error!(error = %e, "server execution failed"),
    }

    Ok(())
}
