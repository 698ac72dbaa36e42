//! Application state wiring the engine together.
//!
//! AppState holds the coordinator used by both CLI commands and REST
//! handlers. The coordinator is generic over the store; the binary pins it
//! to [`SqliteStore`] normally and to [`MemoryStore`] for `--ephemeral`
//! runs.

use std::path::PathBuf;

use anyhow::Context;
use flowline_core::engine::Coordinator;
use flowline_core::memory::MemoryStore;
use flowline_core::repository::EngineStore;
use flowline_infra::config::secret_from_env;
use flowline_infra::executor::build_registry;
use flowline_infra::sqlite::pool::database_url;
use flowline_infra::sqlite::{DatabasePool, SqliteStore};
use flowline_types::config::EngineConfig;

pub type PersistentState = AppState<SqliteStore>;
pub type EphemeralState = AppState<MemoryStore>;

/// Shared application state.
#[derive(Clone)]
pub struct AppState<S> {
    pub coordinator: Coordinator<S>,
    pub data_dir: PathBuf,
    /// Operator bearer token. `None` leaves operator routes open.
    pub api_token: Option<String>,
    /// Trigger HMAC secret. `None` accepts unsigned triggers.
    pub trigger_secret: Option<String>,
}

impl<S: EngineStore> AppState<S> {
    pub fn new(store: S, config: EngineConfig, data_dir: PathBuf) -> Self {
        let executors = build_registry(&config);
        let api_token = secret_from_env(&config.server.api_token_env);
        let trigger_secret = secret_from_env(&config.server.trigger_secret_env);
        if api_token.is_none() {
            tracing::debug!(
                var = config.server.api_token_env.as_str(),
                "no API token configured, operator routes are unauthenticated"
            );
        }

        Self {
            coordinator: Coordinator::new(store, executors, config),
            data_dir,
            api_token,
            trigger_secret,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        self.coordinator.config()
    }
}

impl PersistentState {
    /// Open `{data_dir}/flowline.db`, creating the directory and schema.
    pub async fn init(data_dir: PathBuf, config: EngineConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let pool = DatabasePool::new(&database_url(&data_dir))
            .await
            .context("failed to open database")?;

        Ok(Self::new(SqliteStore::new(pool), config, data_dir))
    }
}

impl EphemeralState {
    /// In-memory engine; nothing survives the process.
    pub fn ephemeral(config: EngineConfig, data_dir: PathBuf) -> Self {
        Self::new(MemoryStore::new(), config, data_dir)
    }
}
