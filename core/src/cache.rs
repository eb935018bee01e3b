//! The durable local cache: a single JSON slot holding the last-known menu.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use tracing::warn;

use crate::db::Database;
use crate::models::WeekMenu;

/// Key of the slot holding the serialized `WeekMenu`.
pub const CACHE_KEY: &str = "weekmenu";

/// Key/value persistence with `getItem`/`setItem` semantics.
pub trait LocalCache: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
}

/// Cache slots stored in the `local_cache` table.
pub struct SqliteCache {
    db: Mutex<Database>,
}

impl SqliteCache {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db: Mutex::new(db) }
    }
}

impl LocalCache for SqliteCache {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.get_cache_item(key)
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.set_cache_item(key, value)
    }
}

#[derive(Default)]
pub struct MemoryCache {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalCache for MemoryCache {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Read the cached menu. Unreadable, unparsable or seedless entries count
/// as "no cache".
pub fn load_menu(cache: &dyn LocalCache) -> Option<WeekMenu> {
    let raw = match cache.get_item(CACHE_KEY) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!("failed to read local week menu cache: {e:#}");
            return None;
        }
    };

    match serde_json::from_str::<WeekMenu>(&raw) {
        Ok(menu) if menu.has_valid_seed() => Some(menu),
        Ok(menu) => {
            warn!(seed = menu.seed, "ignoring cached week menu with invalid seed");
            None
        }
        Err(e) => {
            warn!("failed to parse local week menu cache: {e}");
            None
        }
    }
}

pub fn store_menu(cache: &dyn LocalCache, menu: &WeekMenu) -> Result<()> {
    let json = serde_json::to_string(menu).context("Failed to serialize week menu")?;
    cache
        .set_item(CACHE_KEY, &json)
        .context("Failed to write local week menu cache")
}
