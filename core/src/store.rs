use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use crate::db::Database;
use crate::error::StoreError;
use crate::models::{StoredWeekMenu, WeekMenuRecord, validate_weekmenu_record};

/// The remote `weekmenus` resource. There is no delete: clearing a menu
/// inserts a new logical record.
#[async_trait]
pub trait WeekMenuStore: Send + Sync {
    async fn find_latest_for_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<StoredWeekMenu>, StoreError>;

    /// Insert a record and return its server-assigned id.
    async fn insert(&self, record: &WeekMenuRecord) -> Result<i64, StoreError>;

    async fn update(&self, id: i64, record: &WeekMenuRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreWrite {
    Insert(WeekMenuRecord),
    Update(i64, WeekMenuRecord),
}

impl StoreWrite {
    #[must_use]
    pub fn record(&self) -> &WeekMenuRecord {
        match self {
            Self::Insert(record) | Self::Update(_, record) => record,
        }
    }
}

/// The `weekmenus` table of a local database, for running without a
/// hosted backend.
pub struct DatabaseStore {
    db: Arc<Mutex<Database>>,
}

impl DatabaseStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self::shared(Arc::new(Mutex::new(db)))
    }

    #[must_use]
    pub fn shared(db: Arc<Mutex<Database>>) -> Self {
        Self { db }
    }

    fn check(record: &WeekMenuRecord) -> Result<(), StoreError> {
        validate_weekmenu_record(record).map_err(|e| StoreError::rejected(400, e.to_string()))
    }
}

#[async_trait]
impl WeekMenuStore for DatabaseStore {
    async fn find_latest_for_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<StoredWeekMenu>, StoreError> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(db.find_latest_weekmenu(subscription_id)?)
    }

    async fn insert(&self, record: &WeekMenuRecord) -> Result<i64, StoreError> {
        Self::check(record)?;
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(db.insert_weekmenu(record)?.id)
    }

    async fn update(&self, id: i64, record: &WeekMenuRecord) -> Result<(), StoreError> {
        Self::check(record)?;
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        db.update_weekmenu(id, record)?
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }
}

#[derive(Default)]
struct MemoryStoreState {
    rows: Vec<StoredWeekMenu>,
    next_id: i64,
    writes: Vec<StoreWrite>,
    reads: usize,
    fail_reads: bool,
    fail_writes: bool,
}

/// In-process `weekmenus` resource that records every write.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryStoreState>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Place a row directly, bypassing the write log.
    pub fn put(&self, row: StoredWeekMenu) {
        let mut state = self.lock();
        state.next_id = state.next_id.max(row.id);
        state.rows.retain(|r| r.id != row.id);
        state.rows.push(row);
    }

    #[must_use]
    pub fn get(&self, id: i64) -> Option<StoredWeekMenu> {
        self.lock().rows.iter().find(|r| r.id == id).cloned()
    }

    #[must_use]
    pub fn rows(&self) -> Vec<StoredWeekMenu> {
        self.lock().rows.clone()
    }

    #[must_use]
    pub fn writes(&self) -> Vec<StoreWrite> {
        self.lock().writes.clone()
    }

    #[must_use]
    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    #[must_use]
    pub fn read_count(&self) -> usize {
        self.lock().reads
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }
}

#[async_trait]
impl WeekMenuStore for MemoryStore {
    async fn find_latest_for_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Option<StoredWeekMenu>, StoreError> {
        let mut state = self.lock();
        state.reads += 1;
        if state.fail_reads {
            return Err(StoreError::unreachable("simulated read failure"));
        }
        Ok(state
            .rows
            .iter()
            .filter(|r| r.subscription_id == subscription_id)
            .max_by_key(|r| (r.updated_at, r.id))
            .cloned())
    }

    async fn insert(&self, record: &WeekMenuRecord) -> Result<i64, StoreError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(StoreError::unreachable("simulated write failure"));
        }
        state.next_id += 1;
        let id = state.next_id;
        let now = Utc::now();
        state.rows.push(StoredWeekMenu {
            id,
            subscription_id: record.subscription_id.clone(),
            seed: record.seed,
            version: record.version,
            recipes: record.recipes.clone(),
            created_at: now,
            updated_at: now,
        });
        state.writes.push(StoreWrite::Insert(record.clone()));
        Ok(id)
    }

    async fn update(&self, id: i64, record: &WeekMenuRecord) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(StoreError::unreachable("simulated write failure"));
        }
        let row = state
            .rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;
        row.subscription_id.clone_from(&record.subscription_id);
        row.seed = record.seed;
        row.version = record.version;
        row.recipes.clone_from(&record.recipes);
        row.updated_at = Utc::now();
        state.writes.push(StoreWrite::Update(id, record.clone()));
        Ok(())
    }
}
