use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use kopi_agent::{
    Calculator, ChatEngine, Embedder, HttpEmbedder, HttpLlmClient, LlmClient, OutletSqlGate,
    Planner, ProductIndex, SessionStore,
};
use kopi_core::config::{AppConfig, ConfigError};
use kopi_core::{Catalog, CatalogError, ToolError};
use kopi_db::{connect_read_only, OutletStore, SqlOutletStore};

/// Fully wired runtime: configuration, catalog index, outlet gate, session
/// store, and the chat engine that borrows them all.
pub struct Application {
    pub config: AppConfig,
    pub engine: Arc<ChatEngine>,
    pub index: Arc<ProductIndex>,
    pub gate: Arc<OutletSqlGate>,
    pub sessions: Arc<SessionStore>,
    pub store: Arc<dyn OutletStore>,
    pub calculator: Calculator,
    pub catalog_size: usize,
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("catalog_size", &self.catalog_size)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("product index build failed: {0}")]
    IndexBuild(#[source] ToolError),
    #[error("outlet store connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
}

/// Production wiring: HTTP language-model and embedding clients.
pub async fn bootstrap(config: AppConfig) -> Result<Application, BootstrapError> {
    let llm = Arc::new(HttpLlmClient::from_config(&config.llm)?);
    let embedder = Arc::new(HttpEmbedder::from_config(&config.embedding)?);
    bootstrap_with(config, llm, embedder).await
}

/// Wiring with injected model clients; tests supply scripted ones.
pub async fn bootstrap_with(
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    embedder: Arc<dyn Embedder>,
) -> Result<Application, BootstrapError> {
    info!(catalog = %config.catalog.path.display(), "starting application bootstrap");

    let catalog = Catalog::load(&config.catalog.path)?;
    let catalog_size = catalog.len();

    let index = Arc::new(
        ProductIndex::build(&catalog, embedder).await.map_err(BootstrapError::IndexBuild)?,
    );
    info!(products = catalog_size, "product index built");

    let pool = connect_read_only(
        &config.outlet_store.url,
        config.outlet_store.max_connections,
        config.outlet_store.connect_timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    let store: Arc<dyn OutletStore> = Arc::new(SqlOutletStore::new(pool));
    info!(url = %config.outlet_store.url, "outlet store connected (read-only)");

    let gate = Arc::new(OutletSqlGate::new(
        llm.clone(),
        store.clone(),
        Duration::from_secs(config.outlet_store.query_timeout_secs),
    ));
    let sessions = Arc::new(SessionStore::new(
        config.session.window,
        config.session.ttl_minutes,
        config.session.max_sessions,
    ));

    let engine = Arc::new(ChatEngine::new(
        Planner::new(&config.planner),
        Calculator::new(),
        index.clone(),
        gate.clone(),
        sessions.clone(),
        llm,
        Duration::from_secs(config.llm.timeout_secs),
        Duration::from_secs(config.server.request_deadline_secs),
    ));

    Ok(Application {
        config,
        engine,
        index,
        gate,
        sessions,
        store,
        calculator: Calculator::new(),
        catalog_size,
    })
}
