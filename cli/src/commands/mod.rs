mod helpers;
mod menu;
mod session;
mod shell;

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use crate::config::{Config, Settings};
use crate::remote::RemoteClient;
use menuplan_core::cache::SqliteCache;
use menuplan_core::connectivity::ConnectivityMonitor;
use menuplan_core::db::Database;
use menuplan_core::engine::WeekMenuEngine;
use menuplan_core::session::SessionHandle;
use menuplan_core::store::{DatabaseStore, WeekMenuStore};

pub(crate) use menu::{cmd_add, cmd_clear, cmd_order, cmd_remove, cmd_servings, cmd_show, cmd_sync};
pub(crate) use session::{cmd_login, cmd_logout, cmd_remote};
pub(crate) use shell::cmd_shell;

/// An initialized engine plus the collaborators a command may poke at.
pub(crate) struct Planner {
    pub engine: WeekMenuEngine,
    pub connectivity: ConnectivityMonitor,
    pub remote: Option<Arc<RemoteClient>>,
}

impl Planner {
    /// Build the engine over the local cache and the configured backend,
    /// falling back to the local database's `weekmenus` table when no
    /// backend is set.
    pub async fn open(config: &Config, settings: &Settings) -> Result<Self> {
        let cache = Arc::new(SqliteCache::new(Database::open(&config.db_path)?));

        let mut remote = None;
        let mut online = true;
        let store: Arc<dyn WeekMenuStore> = if let Some(url) = &settings.server_url {
            let client = Arc::new(RemoteClient::new(url, settings.api_key.clone()));
            if let Err(e) = client.health().await {
                debug!("backend unreachable, starting offline: {e:#}");
                online = false;
            }
            remote = Some(client.clone());
            client
        } else {
            Arc::new(DatabaseStore::new(Database::open(&config.db_path)?))
        };

        let connectivity = ConnectivityMonitor::new(online);
        let engine = WeekMenuEngine::builder(cache, store)
            .session(SessionHandle::new(settings.session()))
            .connectivity(connectivity.clone())
            .build();
        engine.initialize().await;

        Ok(Self {
            engine,
            connectivity,
            remote,
        })
    }
}
