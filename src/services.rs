//! Wiring shared by the binaries: open the store and build the pipeline
//! from configuration.
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;
use crate::credentials::CredentialPool;
use crate::db::{self, Pool};
use crate::dedupe::DedupeCache;
use crate::kv::{KvStore, SqliteKvStore};
use crate::notify::{NotificationDispatcher, TwilioSms};
use crate::relevance::{AiStage, ChatReplyEngine};
use crate::scan::{ScanCoordinator, ScanSettings};
use crate::search::SearchClient;
use crate::server::AppState;
use crate::ScoutResult;

/// `DATABASE_URL` if set, else `scout.db` under the data directory.
pub fn database_url(cfg: &Config) -> String {
    std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/scout.db", cfg.app.resolved_data_dir()))
}

pub async fn open_store(cfg: &Config) -> Result<Pool> {
    cfg.ensure_dirs().context("failed to create data_dir")?;
    let url = database_url(cfg);
    let pool = db::init_pool(&url).await?;
    db::run_migrations(&pool)
        .await
        .context("failed to run migrations")?;
    Ok(pool)
}

pub struct Services {
    pub pool: Pool,
    pub credentials: Arc<CredentialPool>,
    pub dispatcher: NotificationDispatcher,
    pub coordinator: Arc<ScanCoordinator>,
    pub kv: Arc<SqliteKvStore>,
}

impl Services {
    pub fn build(cfg: &Config, pool: Pool) -> ScoutResult<Self> {
        let credentials = Arc::new(CredentialPool::from_config(&cfg.search)?);
        let search = Arc::new(SearchClient::from_config(&cfg.search, credentials.clone())?);
        let sms = Arc::new(TwilioSms::from_config(&cfg.sms)?);
        let dispatcher = NotificationDispatcher::new(
            pool.clone(),
            DedupeCache::new(pool.clone()),
            sms,
            search.clone(),
        );

        let ai = match cfg.ai.as_ref() {
            Some(ai_cfg) if cfg.ai_enabled() => {
                let engine = Arc::new(ChatReplyEngine::from_config(ai_cfg)?);
                info!(model = %ai_cfg.model, "ai stage enabled");
                Some(Arc::new(AiStage::from_config(ai_cfg, engine)))
            }
            _ => None,
        };

        let coordinator = Arc::new(ScanCoordinator::new(
            pool.clone(),
            ScanSettings::from_config(cfg),
            search,
            dispatcher.clone(),
            ai,
        ));

        Ok(Self {
            kv: Arc::new(SqliteKvStore::new(pool.clone())),
            pool,
            credentials,
            dispatcher,
            coordinator,
        })
    }

    pub fn app_state(&self, cfg: &Config) -> AppState {
        let kv: Arc<dyn KvStore> = self.kv.clone();
        AppState {
            pool: self.pool.clone(),
            coordinator: self.coordinator.clone(),
            dispatcher: self.dispatcher.clone(),
            kv,
            app: cfg.app.clone(),
            server: cfg.server.clone(),
        }
    }
}
