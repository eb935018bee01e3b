//! The week-menu sync engine.
//!
//! Local state is authoritative: every mutation lands in memory and in the
//! local cache before the call returns, and the remote `weekmenus` record
//! is a debounced, eventually-consistent mirror of it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{self, LocalCache};
use crate::channel::{MenuBroadcast, MenuChannel};
use crate::connectivity::ConnectivityMonitor;
use crate::models::{
    RecipeSelection, WeekMenu, WeekMenuPatch, clamp_servings, random_seed_except,
};
use crate::scheduler::CoalescingScheduler;
use crate::session::{Session, SessionHandle, Subscription};
use crate::store::WeekMenuStore;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(5000);

/// `updated_at` for an edit made after `previous`: now, but always later
/// than `previous` so snapshots order by edit even when the clock stalls.
fn next_timestamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(previous + TimeDelta::microseconds(1))
}

/// Initialization state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No user identity yet; nothing loaded.
    #[default]
    Uninitialized,
    /// A menu is loaded from the cache or synthesized, not tied to a subscription.
    LocalOnly,
    /// Comparing the local menu with the subscription's latest remote record.
    Reconciling,
    /// The menu belongs to the signed-in subscription and syncs remotely.
    Bound,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineState {
    pub weekmenu: Option<WeekMenu>,
    pub is_loading: bool,
    pub is_syncing: bool,
    pub is_offline: bool,
    pub error: Option<String>,
    pub phase: Phase,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub debounce: Duration,
    pub default_servings: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            default_servings: crate::models::DEFAULT_SERVINGS,
        }
    }
}

pub struct WeekMenuEngineBuilder {
    cache: Arc<dyn LocalCache>,
    store: Arc<dyn WeekMenuStore>,
    session: Option<SessionHandle>,
    connectivity: Option<ConnectivityMonitor>,
    channel: Option<MenuChannel>,
    config: EngineConfig,
}

impl WeekMenuEngineBuilder {
    #[must_use]
    pub fn session(mut self, session: SessionHandle) -> Self {
        self.session = Some(session);
        self
    }

    #[must_use]
    pub fn connectivity(mut self, connectivity: ConnectivityMonitor) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    #[must_use]
    pub fn channel(mut self, channel: MenuChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn build(self) -> WeekMenuEngine {
        let rt = Handle::current();
        let connectivity = self.connectivity.unwrap_or_default();
        let (state, _rx) = watch::channel(EngineState {
            weekmenu: None,
            is_loading: true,
            is_syncing: false,
            is_offline: !connectivity.is_online(),
            error: None,
            phase: Phase::Uninitialized,
        });
        WeekMenuEngine {
            inner: Arc::new(Inner {
                origin: Uuid::new_v4(),
                cache: self.cache,
                store: self.store,
                session: self.session.unwrap_or_default(),
                connectivity,
                channel: self.channel,
                config: self.config,
                state,
                generation: AtomicU64::new(0),
                pristine: AtomicBool::new(false),
                scheduler: CoalescingScheduler::new(rt.clone()),
                sync_lock: tokio::sync::Mutex::new(()),
                rt,
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }
}

struct Inner {
    origin: Uuid,
    cache: Arc<dyn LocalCache>,
    store: Arc<dyn WeekMenuStore>,
    session: SessionHandle,
    connectivity: ConnectivityMonitor,
    channel: Option<MenuChannel>,
    config: EngineConfig,
    state: watch::Sender<EngineState>,
    /// Bumped whenever the menu is replaced wholesale (clear, adoption), so
    /// an insert that was in flight does not attach its id to the new menu.
    generation: AtomicU64,
    /// The loaded menu was synthesized and has not been touched since.
    pristine: AtomicBool,
    scheduler: CoalescingScheduler,
    sync_lock: tokio::sync::Mutex<()>,
    rt: Handle,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    /// Persist `menu` to the local cache and make it the in-memory menu.
    fn store_local(&self, s: &mut EngineState, menu: WeekMenu, publish: bool) {
        if let Err(e) = cache::store_menu(self.cache.as_ref(), &menu) {
            warn!("{e:#}");
        }
        if publish {
            if let Some(channel) = &self.channel {
                channel.publish(self.origin, menu.clone());
            }
        }
        s.weekmenu = Some(menu);
    }

    fn replace_menu(&self, s: &mut EngineState, menu: WeekMenu, publish: bool) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.store_local(s, menu, publish);
    }

    fn stop_listeners(&self) {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for handle in listeners.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.stop_listeners();
    }
}

/// Handle to the engine; clones share the same state.
#[derive(Clone)]
pub struct WeekMenuEngine {
    inner: Arc<Inner>,
}

impl WeekMenuEngine {
    #[must_use]
    pub fn builder(
        cache: Arc<dyn LocalCache>,
        store: Arc<dyn WeekMenuStore>,
    ) -> WeekMenuEngineBuilder {
        WeekMenuEngineBuilder {
            cache,
            store,
            session: None,
            connectivity: None,
            channel: None,
            config: EngineConfig::default(),
        }
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // --- Reactive state ---

    #[must_use]
    pub fn state(&self) -> EngineState {
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn weekmenu(&self) -> Option<WeekMenu> {
        self.inner.state.borrow().weekmenu.clone()
    }

    /// Observe every state change (menu, loading, syncing, offline, error).
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn origin(&self) -> Uuid {
        self.inner.origin
    }

    #[must_use]
    pub fn has_pending_write(&self) -> bool {
        self.inner.scheduler.is_pending()
    }

    // --- Initialization ---

    /// Load the menu for the signed-in user. Runs once; later calls are no-ops.
    ///
    /// The local menu (cached, or synthesized when there is none) is adopted
    /// before any network call, then reconciled against the subscription's
    /// latest remote record when a subscription is known.
    pub async fn initialize(&self) {
        let inner = &self.inner;
        let session = inner.session.current();
        if session.user.is_none() {
            debug!("no user yet, week menu not loaded");
            inner.state.send_if_modified(|s| {
                let was_loading = s.is_loading;
                s.is_loading = false;
                was_loading
            });
            return;
        }

        let claimed = inner.state.send_if_modified(|s| {
            if s.phase != Phase::Uninitialized {
                return false;
            }
            if let Some(menu) = cache::load_menu(inner.cache.as_ref()) {
                debug!(version = menu.version, "adopting cached week menu");
                inner.pristine.store(false, Ordering::SeqCst);
                s.weekmenu = Some(menu);
            } else {
                info!("no cached week menu, starting a fresh one");
                inner.pristine.store(true, Ordering::SeqCst);
                inner.store_local(s, WeekMenu::fresh(None), true);
            }
            s.is_loading = false;
            s.phase = Phase::LocalOnly;
            true
        });
        if !claimed {
            return;
        }

        if let Some(subscription) = session.subscription {
            if self.is_offline() {
                debug!("offline, reconciling once the connection returns");
                return;
            }
            self.reconcile(&subscription).await;
            // A fresh menu bound at startup is inserted by its first edit
            self.bind(&subscription, false).await;
        }
    }

    fn is_offline(&self) -> bool {
        self.inner.state.borrow().is_offline
    }

    /// The subscription of a signed-in session whose menu was never
    /// reconciled, because the engine was offline at the time.
    fn deferred_subscription(&self) -> Option<Subscription> {
        if self.inner.state.borrow().phase != Phase::LocalOnly {
            return None;
        }
        let session = self.inner.session.current();
        session.user.and(session.subscription)
    }

    /// Compare the local menu with the subscription's latest remote record
    /// and adopt whichever was updated later. Local wins ties. Returns
    /// whether the remote menu was adopted.
    async fn reconcile(&self, subscription: &Subscription) -> bool {
        let inner = &self.inner;
        let mut before = None;
        inner.state.send_modify(|s| {
            s.phase = Phase::Reconciling;
            before = s
                .weekmenu
                .as_ref()
                .map(|m| (inner.generation.load(Ordering::SeqCst), m.version));
        });

        match inner
            .store
            .find_latest_for_subscription(&subscription.id)
            .await
        {
            Ok(Some(remote)) => {
                let mut adopted = false;
                inner.state.send_modify(|s| {
                    let Some(local) = s.weekmenu.as_ref() else {
                        return;
                    };
                    let marker = (inner.generation.load(Ordering::SeqCst), local.version);
                    if before != Some(marker) {
                        debug!("week menu changed during reconciliation, keeping local");
                        return;
                    }
                    let pristine = inner.pristine.load(Ordering::SeqCst);
                    if pristine || remote.updated_at > local.updated_at {
                        info!(id = remote.id, version = remote.version, "adopting remote week menu");
                        inner.pristine.store(false, Ordering::SeqCst);
                        inner.replace_menu(s, WeekMenu::from_stored(remote), true);
                        adopted = true;
                    } else {
                        debug!(id = remote.id, "local week menu is at least as recent, keeping it");
                    }
                });
                adopted
            }
            Ok(None) => {
                debug!(subscription = %subscription.id, "no remote week menu yet");
                false
            }
            Err(e) => {
                warn!("failed to fetch remote week menu: {e}");
                inner.state.send_modify(|s| s.error = Some(e.to_string()));
                false
            }
        }
    }

    /// Tie the loaded menu to `subscription`. A menu created before the
    /// subscription was known gets its `subscription_id` backfilled and is
    /// synced immediately.
    pub async fn bind_subscription(&self, subscription: &Subscription) {
        self.bind(subscription, true).await;
    }

    /// Returns whether the backfilled menu was synced.
    async fn bind(&self, subscription: &Subscription, sync_fresh: bool) -> bool {
        let inner = &self.inner;
        let mut backfilled = false;
        inner.state.send_modify(|s| {
            s.phase = Phase::Bound;
            let Some(menu) = s.weekmenu.as_ref() else {
                return;
            };
            if menu.subscription_id.is_some() {
                return;
            }
            let mut menu = menu.clone();
            if WeekMenuPatch::subscription(&subscription.id).apply(&mut menu) {
                inner.store_local(s, menu, true);
                backfilled = true;
            }
        });
        if !backfilled {
            return false;
        }
        info!(subscription = %subscription.id, "backfilled subscription onto week menu");
        if sync_fresh || !inner.pristine.load(Ordering::SeqCst) {
            self.sync_now().await;
            return true;
        }
        false
    }

    async fn on_session(&self, session: Session) {
        let phase = self.inner.state.borrow().phase;
        match (phase, session.user, session.subscription) {
            (Phase::Uninitialized, ..) => self.initialize().await,
            (Phase::LocalOnly, Some(_), Some(subscription)) => {
                if self.is_offline() {
                    debug!("offline, reconciling once the connection returns");
                    return;
                }
                self.reconcile(&subscription).await;
                self.bind_subscription(&subscription).await;
            }
            _ => {}
        }
    }

    // --- Mutators ---

    fn default_servings(&self) -> u32 {
        self.inner
            .session
            .current()
            .subscription
            .map(|s| s.default_servings)
            .filter(|&n| n > 0)
            .unwrap_or(self.inner.config.default_servings)
    }

    /// Apply the patch built from the current menu. A `None` patch, or one
    /// that changes nothing, leaves the menu and its version untouched.
    fn update_with<F>(&self, build: F) -> bool
    where
        F: FnOnce(&WeekMenu) -> Option<WeekMenuPatch>,
    {
        let inner = &self.inner;
        let changed = inner.state.send_if_modified(|s| {
            let Some(current) = s.weekmenu.as_ref() else {
                debug!("no week menu loaded, ignoring update");
                return false;
            };
            let Some(patch) = build(current) else {
                return false;
            };
            let mut next = current.clone();
            if !patch.apply(&mut next) {
                return false;
            }
            next.version = current.version + 1;
            next.updated_at = next_timestamp(current.updated_at);
            inner.pristine.store(false, Ordering::SeqCst);
            inner.store_local(s, next, true);
            true
        });
        if changed {
            self.schedule_sync();
        }
        changed
    }

    /// Merge `patch` into the menu, bump its version and schedule a
    /// debounced remote write. Returns whether the menu changed.
    pub fn update_weekmenu(&self, patch: WeekMenuPatch) -> bool {
        self.update_with(|_| Some(patch))
    }

    /// Add a recipe unless it is already on the menu or its id is blank.
    /// Servings default to the subscription's household size and are
    /// floored at one.
    pub fn add_recipe(&self, recipe_id: &str, servings: Option<i64>) -> bool {
        if recipe_id.trim().is_empty() {
            debug!("ignoring recipe with a blank id");
            return false;
        }
        let servings = servings.map_or_else(|| self.default_servings(), clamp_servings);
        self.update_with(|menu| {
            if menu.contains(recipe_id) {
                debug!(recipe_id, "recipe already on the menu");
                return None;
            }
            let mut recipes = menu.recipes.clone();
            recipes.push(RecipeSelection {
                recipe_id: recipe_id.to_string(),
                servings,
            });
            Some(WeekMenuPatch::recipes(recipes))
        })
    }

    pub fn remove_recipe(&self, recipe_id: &str) -> bool {
        self.update_with(|menu| {
            if !menu.contains(recipe_id) {
                return None;
            }
            let recipes = menu
                .recipes
                .iter()
                .filter(|r| r.recipe_id != recipe_id)
                .cloned()
                .collect();
            Some(WeekMenuPatch::recipes(recipes))
        })
    }

    /// Set the servings for a recipe on the menu, floored at one.
    pub fn update_servings(&self, recipe_id: &str, servings: i64) -> bool {
        let servings = clamp_servings(servings);
        self.update_with(|menu| {
            let recipes = menu
                .recipes
                .iter()
                .map(|r| {
                    if r.recipe_id == recipe_id {
                        RecipeSelection {
                            recipe_id: r.recipe_id.clone(),
                            servings,
                        }
                    } else {
                        r.clone()
                    }
                })
                .collect();
            Some(WeekMenuPatch::recipes(recipes))
        })
    }

    /// Replace the menu with a fresh, empty one (new seed, version 1) and
    /// sync it right away.
    pub async fn clear_menu(&self) {
        let inner = &self.inner;
        let session_subscription = inner.session.current().subscription.map(|s| s.id);
        let cleared = inner.state.send_if_modified(|s| {
            let Some(current) = s.weekmenu.as_ref() else {
                debug!("no week menu loaded, nothing to clear");
                return false;
            };
            let mut menu = WeekMenu::fresh(
                current
                    .subscription_id
                    .clone()
                    .or(session_subscription),
            );
            menu.seed = random_seed_except(current.seed);
            menu.updated_at = next_timestamp(current.updated_at);
            inner.pristine.store(false, Ordering::SeqCst);
            inner.replace_menu(s, menu, true);
            true
        });
        if cleared {
            info!("week menu cleared");
            self.sync_now().await;
        }
    }

    // --- Remote sync ---

    fn schedule_sync(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .scheduler
            .schedule(self.inner.config.debounce, move || async move {
                if let Some(engine) = Self::upgrade(&weak) {
                    engine.sync_to_database().await;
                }
            });
    }

    /// Write the current menu remotely now, dropping any pending debounced write.
    pub async fn sync_now(&self) {
        self.inner.scheduler.cancel();
        self.sync_to_database().await;
    }

    /// Run a pending debounced write immediately and wait for any write in
    /// flight. For consumers about to go away.
    pub async fn flush(&self) {
        if self.inner.scheduler.cancel() {
            self.sync_to_database().await;
        }
        // A timer that just fired may not have reached the lock yet
        tokio::task::yield_now().await;
        let _in_flight = self.inner.sync_lock.lock().await;
    }

    /// Insert or update the remote record with the menu as it is now.
    ///
    /// Skipped while signed out, without a subscription, or offline; the
    /// next mutation or reconnection retries. Failures land in `error` and
    /// never roll back local state.
    pub async fn sync_to_database(&self) {
        let inner = &self.inner;
        let session = inner.session.current();
        if session.user.is_none() {
            debug!("not signed in, deferring week menu sync");
            return;
        }
        let Some(subscription) = session.subscription else {
            debug!("no subscription yet, deferring week menu sync");
            return;
        };
        if inner.state.borrow().is_offline {
            debug!("offline, deferring week menu sync");
            return;
        }

        let _guard = inner.sync_lock.lock().await;
        let snapshot = {
            let s = inner.state.borrow();
            s.weekmenu
                .clone()
                .map(|menu| (menu, inner.generation.load(Ordering::SeqCst)))
        };
        let Some((menu, generation)) = snapshot else {
            return;
        };

        let subscription_id = menu
            .subscription_id
            .clone()
            .unwrap_or_else(|| subscription.id.clone());
        let record = menu.to_record(&subscription_id);

        inner.state.send_modify(|s| s.is_syncing = true);
        let result = match menu.id {
            None => inner.store.insert(&record).await.map(Some),
            Some(id) => inner.store.update(id, &record).await.map(|()| None),
        };

        inner.state.send_modify(|s| {
            s.is_syncing = false;
            match result {
                Ok(assigned) => {
                    s.error = None;
                    debug!(version = menu.version, "week menu synced");
                    if let Some(id) = assigned {
                        Self::merge_remote_id(inner, s, id, generation);
                    }
                }
                Err(e) => {
                    warn!("week menu sync failed: {e}");
                    s.error = Some(e.to_string());
                }
            }
        });
    }

    fn merge_remote_id(inner: &Inner, s: &mut EngineState, id: i64, generation: u64) {
        if inner.generation.load(Ordering::SeqCst) != generation {
            debug!(id, "week menu was replaced while inserting, not attaching id");
            return;
        }
        let Some(menu) = s.weekmenu.as_ref() else {
            return;
        };
        if menu.id.is_some() {
            return;
        }
        let mut menu = menu.clone();
        menu.id = Some(id);
        info!(id, "week menu stored remotely");
        inner.store_local(s, menu, true);
    }

    // --- Connectivity ---

    pub fn handle_offline(&self) {
        let changed = self.inner.state.send_if_modified(|s| {
            if s.is_offline {
                return false;
            }
            s.is_offline = true;
            true
        });
        if changed {
            info!("connection lost, working offline");
        }
    }

    /// Flush local edits as soon as the connection comes back. A menu that
    /// was loaded while offline is reconciled with the remote one first.
    pub async fn handle_online(&self) {
        let changed = self.inner.state.send_if_modified(|s| {
            if !s.is_offline {
                return false;
            }
            s.is_offline = false;
            true
        });
        if !changed {
            return;
        }
        info!("back online, syncing week menu");
        if let Some(subscription) = self.deferred_subscription() {
            let adopted = self.reconcile(&subscription).await;
            let synced = self.bind(&subscription, false).await;
            if adopted || synced || self.inner.pristine.load(Ordering::SeqCst) {
                self.inner.scheduler.cancel();
                return;
            }
        }
        self.sync_now().await;
    }

    // --- Cross-tab ---

    /// Adopt a snapshot written by another engine sharing the cache slot
    /// when it is newer than ours, or is our menu with a newly known id.
    /// A snapshot with our seed is the same menu, so an insert in flight
    /// may still attach its id to it.
    fn apply_broadcast(&self, msg: MenuBroadcast) {
        let inner = &self.inner;
        if msg.origin == inner.origin {
            return;
        }
        inner.state.send_if_modified(|s| {
            let Some(local) = s.weekmenu.as_ref() else {
                return false;
            };
            let newer = msg.menu.updated_at > local.updated_at;
            let learned_id = msg.menu.updated_at == local.updated_at
                && msg.menu.seed == local.seed
                && local.id.is_none()
                && msg.menu.id.is_some();
            if !newer && !learned_id {
                return false;
            }
            debug!(version = msg.menu.version, "adopting week menu from another tab");
            inner.pristine.store(false, Ordering::SeqCst);
            let mut menu = msg.menu;
            if menu.seed == local.seed {
                if menu.id.is_none() {
                    menu.id = local.id;
                }
                inner.store_local(s, menu, false);
            } else {
                inner.replace_menu(s, menu, false);
            }
            true
        });
    }

    // --- Lifecycle ---

    /// Spawn the listeners reacting to session, connectivity and cross-tab
    /// events. Calling it again while they run does nothing.
    pub fn start(&self) {
        let inner = &self.inner;
        let mut listeners = inner.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        if !listeners.is_empty() {
            return;
        }

        let weak = Arc::downgrade(inner);
        let mut session_rx = inner.session.subscribe();
        listeners.push(inner.rt.spawn(async move {
            loop {
                let session = session_rx.borrow_and_update().clone();
                let Some(engine) = Self::upgrade(&weak) else {
                    break;
                };
                engine.on_session(session).await;
                drop(engine);
                if session_rx.changed().await.is_err() {
                    break;
                }
            }
        }));

        let weak = Arc::downgrade(inner);
        let mut online_rx = inner.connectivity.subscribe();
        listeners.push(inner.rt.spawn(async move {
            loop {
                let online = *online_rx.borrow_and_update();
                let Some(engine) = Self::upgrade(&weak) else {
                    break;
                };
                if online {
                    engine.handle_online().await;
                } else {
                    engine.handle_offline();
                }
                drop(engine);
                if online_rx.changed().await.is_err() {
                    break;
                }
            }
        }));

        if let Some(channel) = &inner.channel {
            let weak = Arc::downgrade(inner);
            let mut menu_rx = channel.subscribe();
            listeners.push(inner.rt.spawn(async move {
                loop {
                    match menu_rx.recv().await {
                        Ok(msg) => {
                            let Some(engine) = Self::upgrade(&weak) else {
                                break;
                            };
                            engine.apply_broadcast(msg);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "cross-tab week menu updates skipped");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }));
        }
    }

    /// Stop listeners and drop any pending debounced write.
    pub fn shutdown(&self) {
        if self.inner.scheduler.cancel() {
            debug!("dropped pending week menu write on shutdown");
        }
        self.inner.stop_listeners();
    }
}
