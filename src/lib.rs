pub mod autoregister;
pub mod config;
pub mod db;
pub mod errors;
pub mod generator;
pub mod matcher;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod places;
pub mod regions;
pub mod rejects;
pub mod report;
pub mod reverify;
pub mod secrets;
pub mod storage;
pub mod store;
pub mod throttle;
pub mod verifier;

use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::db::{bootstrap, DatabaseContext};
use crate::generator::HttpCandidateGenerator;
use crate::places::HttpPlacesClient;
use crate::store::SqlitePlaceStore;

pub use crate::autoregister::{
    AutoRegistrar, PlaceMention, RegistrationReport, RegistrationRequest,
};
pub use crate::config::AppConfig;
pub use crate::errors::{AppError, AppResult};
pub use crate::model::{Candidate, Category, Confidence, RejectReason, VerifiedPlace};
pub use crate::pipeline::{JobSpec, Pipeline, RunOptions};
pub use crate::report::RunReport;
pub use crate::reverify::{ReverifyOptions, ReverifyReport, Reverifier};
pub use crate::secrets::SecretVault;
pub use crate::verifier::Verifier;

pub const VAULT_SERVICE_NAME: &str = "PlaceVerifier";

/// Shared handles for one process: configuration, keychain and the place store.
pub struct AppContext {
    config: AppConfig,
    vault: SecretVault,
    store: Arc<SqlitePlaceStore>,
}

impl AppContext {
    pub fn initialize() -> AppResult<Self> {
        init_tracing();
        let vault = SecretVault::new(VAULT_SERVICE_NAME);
        let env_config = AppConfig::from_env();
        let config = match env_config.clone().with_vault(&vault) {
            Ok(config) => config,
            Err(err) => {
                warn!(%err, "keychain unavailable; using environment credentials only");
                env_config
            }
        };
        Self::with_config(config, vault)
    }

    pub fn with_config(config: AppConfig, vault: SecretVault) -> AppResult<Self> {
        let DatabaseContext { connection, .. } = bootstrap(&config.database_path)?;
        Ok(Self {
            store: Arc::new(SqlitePlaceStore::new(Arc::new(Mutex::new(connection)))),
            config,
            vault,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn vault(&self) -> &SecretVault {
        &self.vault
    }

    pub fn store(&self) -> Arc<SqlitePlaceStore> {
        Arc::clone(&self.store)
    }

    fn places_client(&self) -> AppResult<Arc<HttpPlacesClient>> {
        Ok(Arc::new(HttpPlacesClient::new(&self.config)?))
    }

    fn verifier_with(&self, client: Arc<HttpPlacesClient>) -> Arc<Verifier> {
        Arc::new(Verifier::new(client, self.config.search_bias_radius_m))
    }

    pub fn verifier(&self) -> AppResult<Arc<Verifier>> {
        Ok(self.verifier_with(self.places_client()?))
    }

    pub fn pipeline(&self) -> AppResult<Pipeline> {
        let generator = Arc::new(HttpCandidateGenerator::new(&self.config)?);
        Ok(Pipeline::new(
            &self.config,
            generator,
            self.verifier()?,
            self.store(),
        ))
    }

    pub fn reverifier(&self) -> AppResult<Reverifier> {
        Ok(Reverifier::new(&self.config, self.verifier()?, self.store()))
    }

    pub fn registrar(&self) -> AppResult<AutoRegistrar> {
        let client = self.places_client()?;
        let registrar = AutoRegistrar::new(
            &self.config,
            self.verifier_with(client.clone()),
            self.store(),
        );
        Ok(match storage::from_config(&self.config)? {
            Some(assets) => registrar.with_photos(client, assets),
            None => {
                warn!("no asset storage configured; registered places get no photo");
                registrar
            }
        })
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,place_verifier=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    });
}
