use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::models::{RecipeSelection, StoredWeekMenu, WeekMenuRecord};

pub struct Database {
    conn: Connection,
}

/// Fixed-width UTC timestamps so `ORDER BY updated_at` sorts chronologically.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS weekmenus (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    subscription_id TEXT NOT NULL,
                    seed INTEGER NOT NULL CHECK (seed BETWEEN 1 AND 999999),
                    version INTEGER NOT NULL CHECK (version >= 1),
                    recipes TEXT NOT NULL DEFAULT '[]',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_weekmenus_subscription
                    ON weekmenus(subscription_id, updated_at);

                PRAGMA user_version = 1;",
            )?;
        }

        if version < 2 {
            self.conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS local_cache (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                PRAGMA user_version = 2;",
            )?;
        }

        Ok(())
    }

    // --- Row mapping helpers ---

    // Expects columns:
    // 0: id, 1: subscription_id, 2: seed, 3: version, 4: recipes,
    // 5: created_at, 6: updated_at
    fn weekmenu_from_row(row: &rusqlite::Row) -> rusqlite::Result<StoredWeekMenu> {
        let recipes_json: String = row.get(4)?;
        let recipes: Vec<RecipeSelection> = serde_json::from_str(&recipes_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let created_at: String = row.get(5)?;
        let updated_at: String = row.get(6)?;
        Ok(StoredWeekMenu {
            id: row.get(0)?,
            subscription_id: row.get(1)?,
            seed: row.get(2)?,
            version: row.get(3)?,
            recipes,
            created_at: parse_timestamp(5, &created_at)?,
            updated_at: parse_timestamp(6, &updated_at)?,
        })
    }

    // --- Week menus ---

    pub fn insert_weekmenu(&self, record: &WeekMenuRecord) -> Result<StoredWeekMenu> {
        let now = timestamp(Utc::now());
        let recipes = serde_json::to_string(&record.recipes)?;
        self.conn
            .execute(
                "INSERT INTO weekmenus (subscription_id, seed, version, recipes, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![record.subscription_id, record.seed, record.version, recipes, now],
            )
            .context("Failed to insert week menu")?;
        let id = self.conn.last_insert_rowid();
        self.get_weekmenu(id)?
            .context("Inserted week menu disappeared")
    }

    /// Overwrite the row with `id`. Returns `None` when no such row exists.
    pub fn update_weekmenu(
        &self,
        id: i64,
        record: &WeekMenuRecord,
    ) -> Result<Option<StoredWeekMenu>> {
        let now = timestamp(Utc::now());
        let recipes = serde_json::to_string(&record.recipes)?;
        let rows = self
            .conn
            .execute(
                "UPDATE weekmenus
                 SET subscription_id = ?1, seed = ?2, version = ?3, recipes = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![record.subscription_id, record.seed, record.version, recipes, now, id],
            )
            .context("Failed to update week menu")?;
        if rows == 0 {
            return Ok(None);
        }
        self.get_weekmenu(id)
    }

    pub fn get_weekmenu(&self, id: i64) -> Result<Option<StoredWeekMenu>> {
        self.conn
            .query_row(
                "SELECT id, subscription_id, seed, version, recipes, created_at, updated_at
                 FROM weekmenus WHERE id = ?1",
                params![id],
                Self::weekmenu_from_row,
            )
            .optional()
            .context("Failed to read week menu")
    }

    pub fn find_latest_weekmenu(&self, subscription_id: &str) -> Result<Option<StoredWeekMenu>> {
        self.conn
            .query_row(
                "SELECT id, subscription_id, seed, version, recipes, created_at, updated_at
                 FROM weekmenus
                 WHERE subscription_id = ?1
                 ORDER BY updated_at DESC, id DESC
                 LIMIT 1",
                params![subscription_id],
                Self::weekmenu_from_row,
            )
            .optional()
            .context("Failed to read latest week menu")
    }

    pub fn list_weekmenus(&self, subscription_id: &str) -> Result<Vec<StoredWeekMenu>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, subscription_id, seed, version, recipes, created_at, updated_at
             FROM weekmenus
             WHERE subscription_id = ?1
             ORDER BY updated_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![subscription_id], Self::weekmenu_from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?);
        }
        Ok(results)
    }

    // --- Local cache slots ---

    pub fn set_cache_item(&self, key: &str, value: &str) -> Result<()> {
        let now = timestamp(Utc::now());
        self.conn.execute(
            "INSERT INTO local_cache (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        Ok(())
    }

    pub fn get_cache_item(&self, key: &str) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM local_cache WHERE key = ?1")?;
        let mut rows = stmt.query(params![key])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(subscription_id: &str) -> WeekMenuRecord {
        WeekMenuRecord {
            subscription_id: subscription_id.to_string(),
            seed: 31337,
            version: 2,
            recipes: vec![
                RecipeSelection {
                    recipe_id: "risotto".to_string(),
                    servings: 4,
                },
                RecipeSelection {
                    recipe_id: "tacos".to_string(),
                    servings: 2,
                },
            ],
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        let version: i64 = db
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, 2);
    }

    #[test]
    fn test_open_file_database() {
        let dir = std::env::temp_dir().join(format!("menuplan-db-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("menuplan.db");
        {
            let db = Database::open(&path).unwrap();
            db.set_cache_item("weekmenu", "{}").unwrap();
        }
        let db = Database::open(&path).unwrap();
        assert_eq!(db.get_cache_item("weekmenu").unwrap().as_deref(), Some("{}"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_insert_and_get_weekmenu() {
        let db = Database::open_in_memory().unwrap();
        let stored = db.insert_weekmenu(&sample_record("sub-1")).unwrap();

        assert!(stored.id > 0);
        assert_eq!(stored.subscription_id, "sub-1");
        assert_eq!(stored.seed, 31337);
        assert_eq!(stored.version, 2);
        assert_eq!(stored.recipes.len(), 2);
        assert_eq!(stored.recipes[0].recipe_id, "risotto");
        assert_eq!(stored.created_at, stored.updated_at);

        let fetched = db.get_weekmenu(stored.id).unwrap().unwrap();
        assert_eq!(fetched, stored);
    }

    #[test]
    fn test_get_weekmenu_missing() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_weekmenu(42).unwrap().is_none());
    }

    #[test]
    fn test_update_weekmenu() {
        let db = Database::open_in_memory().unwrap();
        let stored = db.insert_weekmenu(&sample_record("sub-1")).unwrap();

        let mut record = sample_record("sub-1");
        record.version = 3;
        record.recipes.pop();
        let updated = db.update_weekmenu(stored.id, &record).unwrap().unwrap();

        assert_eq!(updated.id, stored.id);
        assert_eq!(updated.version, 3);
        assert_eq!(updated.recipes.len(), 1);
        assert_eq!(updated.created_at, stored.created_at);
        assert!(updated.updated_at >= stored.updated_at);
    }

    #[test]
    fn test_update_weekmenu_not_found() {
        let db = Database::open_in_memory().unwrap();
        assert!(
            db.update_weekmenu(99, &sample_record("sub-1"))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_find_latest_weekmenu() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.find_latest_weekmenu("sub-1").unwrap().is_none());

        let first = db.insert_weekmenu(&sample_record("sub-1")).unwrap();
        let second = db.insert_weekmenu(&sample_record("sub-1")).unwrap();
        db.insert_weekmenu(&sample_record("sub-2")).unwrap();

        let latest = db.find_latest_weekmenu("sub-1").unwrap().unwrap();
        assert_eq!(latest.id, second.id);

        // Touching the older row makes it the latest again
        std::thread::sleep(std::time::Duration::from_millis(2));
        db.update_weekmenu(first.id, &sample_record("sub-1"))
            .unwrap();
        let latest = db.find_latest_weekmenu("sub-1").unwrap().unwrap();
        assert_eq!(latest.id, first.id);
    }

    #[test]
    fn test_list_weekmenus() {
        let db = Database::open_in_memory().unwrap();
        db.insert_weekmenu(&sample_record("sub-1")).unwrap();
        db.insert_weekmenu(&sample_record("sub-1")).unwrap();
        db.insert_weekmenu(&sample_record("sub-2")).unwrap();

        let rows = db.list_weekmenus("sub-1").unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows[0].id > rows[1].id);
        assert!(db.list_weekmenus("nobody").unwrap().is_empty());
    }

    #[test]
    fn test_cache_item_upsert() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_cache_item("weekmenu").unwrap().is_none());

        db.set_cache_item("weekmenu", "one").unwrap();
        db.set_cache_item("weekmenu", "two").unwrap();
        assert_eq!(db.get_cache_item("weekmenu").unwrap().as_deref(), Some("two"));
    }
}
