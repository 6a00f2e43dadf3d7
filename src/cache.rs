//! Tiered read cache that learns which streams are worth caching.
//!
//! A key is only stored once it has been offered in two distinct sweep
//! windows without an eviction in between. Writes evict, so streams that
//! are written about as often as they are read never get cached at all.
//!
//! ```text
//!  cache()        sweep         cache()
//! ---------> L0 ---------> L1 ---------> Cachable (value stored)
//!             ^                              |
//!             +------ evict() / cadence -----+
//! ```
//!
//! Tier membership is cleared on fixed sweep cadences: Level0 on every
//! sweep (its members move to Level1), Level1 every
//! [`level1_every`](CacheConfig::level1_every) sweeps, Cachable every
//! [`long_every`](CacheConfig::long_every) sweeps. Values cached with an
//! explicit [`CacheTtl`] skip promotion and live for that fixed time.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

/// Fixed lifetime hint that bypasses tier promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTtl {
    /// Ten seconds.
    TenSeconds,
    /// One minute.
    OneMinute,
    /// Five minutes.
    FiveMinutes,
}

impl CacheTtl {
    /// All hints, shortest first.
    pub const ALL: [CacheTtl; 3] = [Self::TenSeconds, Self::OneMinute, Self::FiveMinutes];

    /// Lifetime as a `Duration`.
    pub fn duration(self) -> Duration {
        match self {
            Self::TenSeconds => Duration::from_secs(10),
            Self::OneMinute => Duration::from_secs(60),
            Self::FiveMinutes => Duration::from_secs(300),
        }
    }
}

/// Sweep cadence of a [`TieredCache`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_uow::CacheConfig;
///
/// let config = CacheConfig {
///     sweep_interval: Duration::from_millis(100),
///     ..CacheConfig::default()
/// };
/// assert_eq!(config.level1_every, 12);
/// assert_eq!(config.long_every, 120);
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Period of the background sweep. One period is one sweep window.
    ///
    /// Default: 5 seconds.
    pub sweep_interval: Duration,

    /// Level1 membership is cleared every this many sweeps.
    ///
    /// Default: 12.
    pub level1_every: u64,

    /// Cachable membership and stored values are dropped every this many
    /// sweeps.
    ///
    /// Default: 120.
    pub long_every: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(5),
            level1_every: 12,
            long_every: 120,
        }
    }
}

impl CacheConfig {
    /// Number of sweeps after which a TTL tier is cleared (at least one).
    pub fn sweeps_for(&self, ttl: CacheTtl) -> u64 {
        let interval = self.sweep_interval.as_millis().max(1);
        let sweeps = ttl.duration().as_millis().div_ceil(interval);
        u64::try_from(sweeps).unwrap_or(u64::MAX).max(1)
    }
}

/// Tier a key currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Not tracked.
    Uncached,
    /// Offered once in the current sweep window.
    Level0,
    /// Offered in an earlier sweep window.
    Level1,
    /// Promoted; the value is stored.
    Cachable,
    /// Stored with a fixed lifetime.
    Ttl(CacheTtl),
}

/// Hit and miss counters plus the number of stored values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Retrievals that found a value.
    pub hits: u64,
    /// Retrievals that found nothing.
    pub misses: u64,
    /// Values currently stored.
    pub entries: usize,
}

#[derive(Debug, Default)]
struct Tiers {
    level0: HashSet<String>,
    level1: HashSet<String>,
    cachable: HashSet<String>,
    ttl: HashMap<CacheTtl, HashSet<String>>,
    sweeps: u64,
}

impl Tiers {
    fn forget(&mut self, key: &str) {
        self.level0.remove(key);
        self.level1.remove(key);
        self.cachable.remove(key);
        for set in self.ttl.values_mut() {
            set.remove(key);
        }
    }
}

type Value = Arc<dyn Any + Send + Sync>;

/// Process-wide, best-effort read-through cache.
///
/// Values are type-erased; [`retrieve`](TieredCache::retrieve) downcasts
/// and clones. A wrong type reads as a miss. Stored values live in a
/// `RwLock` separate from the tier bookkeeping, so a running sweep never
/// blocks readers for longer than the final removal.
pub struct TieredCache {
    config: CacheConfig,
    values: RwLock<HashMap<String, Value>>,
    tiers: Mutex<Tiers>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for TieredCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl TieredCache {
    /// Create an empty cache.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            values: RwLock::new(HashMap::new()),
            tiers: Mutex::new(Tiers::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Sweep cadence.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn tiers(&self) -> MutexGuard<'_, Tiers> {
        self.tiers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Values are only written while the caller holds the tier lock, so an
    /// [`evict`](TieredCache::evict) can never slip between the tier check
    /// and the insert. Lock order is always tiers, then values.
    fn store_value(&self, _tiers: &MutexGuard<'_, Tiers>, key: &str, value: Value) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), value);
    }

    /// Offer a value for `key`.
    ///
    /// Without a TTL hint the key advances one tier per sweep window and
    /// the value is only stored once the key is [`Tier::Cachable`]. With a
    /// hint the value is stored at once and dropped after the hint's
    /// lifetime.
    pub fn cache<T: Any + Send + Sync>(&self, key: &str, value: T, ttl: Option<CacheTtl>) {
        let mut tiers = self.tiers();
        if let Some(ttl) = ttl {
            tiers.forget(key);
            tiers.ttl.entry(ttl).or_default().insert(key.to_owned());
            self.store_value(&tiers, key, Arc::new(value));
            return;
        }

        if tiers.cachable.contains(key) {
            self.store_value(&tiers, key, Arc::new(value));
        } else if tiers.level1.remove(key) {
            tiers.cachable.insert(key.to_owned());
            self.store_value(&tiers, key, Arc::new(value));
            drop(tiers);
            tracing::debug!(key, "cache key promoted");
        } else {
            tiers.level0.insert(key.to_owned());
        }
    }

    /// Fetch a stored value.
    pub fn retrieve<T: Any + Clone>(&self, key: &str) -> Option<T> {
        let found = self
            .values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned();
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Drop any stored value and reset the key to [`Tier::Uncached`].
    pub fn evict(&self, key: &str) {
        let mut tiers = self.tiers();
        tiers.forget(key);
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Current tier of `key`.
    pub fn tier(&self, key: &str) -> Tier {
        let tiers = self.tiers();
        if tiers.cachable.contains(key) {
            return Tier::Cachable;
        }
        for ttl in CacheTtl::ALL {
            if tiers.ttl.get(&ttl).is_some_and(|s| s.contains(key)) {
                return Tier::Ttl(ttl);
            }
        }
        if tiers.level1.contains(key) {
            Tier::Level1
        } else if tiers.level0.contains(key) {
            Tier::Level0
        } else {
            Tier::Uncached
        }
    }

    /// Run one sweep: close the current window and clear tiers whose
    /// cadence is due.
    pub fn sweep(&self) {
        let mut tiers = self.tiers();
        tiers.sweeps += 1;
        let n = tiers.sweeps;

        if n % self.config.level1_every.max(1) == 0 {
            tiers.level1.clear();
        }
        let opened = std::mem::take(&mut tiers.level0);
        tiers.level1.extend(opened);

        let mut expired: Vec<String> = Vec::new();
        if n % self.config.long_every.max(1) == 0 {
            expired.extend(tiers.cachable.drain());
        }
        for ttl in CacheTtl::ALL {
            if n % self.config.sweeps_for(ttl) == 0
                && let Some(set) = tiers.ttl.get_mut(&ttl)
            {
                expired.extend(set.drain());
            }
        }

        if !expired.is_empty() {
            let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
            for key in &expired {
                values.remove(key);
            }
            tracing::debug!(expired = expired.len(), "cache sweep dropped values");
        }
    }

    /// Stored values whose key is in no tier; such a value would never
    /// expire.
    #[cfg(test)]
    fn orphaned_values(&self) -> usize {
        let tiers = self.tiers();
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values
            .keys()
            .filter(|k| !tiers.cachable.contains(*k) && !tiers.ttl.values().any(|s| s.contains(*k)))
            .count()
    }

    /// Number of sweeps run so far.
    pub fn sweeps(&self) -> u64 {
        self.tiers().sweeps
    }

    /// Hit and miss counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self
                .values
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }

    /// Start the periodic sweep on the current tokio runtime.
    ///
    /// The task holds only a weak reference: it stops on its own once the
    /// cache is dropped, or when [`SweeperHandle::shutdown`] is called.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let weak = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            tracing::info!(period_ms = period.as_millis() as u64, "cache sweeper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(cache) = weak.upgrade() else { break };
                        cache.sweep();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("cache sweeper stopped");
        });

        SweeperHandle {
            shutdown_tx,
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }
}

/// Handle for the background sweep task.
///
/// Dropping the handle does **not** stop the task; call
/// [`shutdown`](SweeperHandle::shutdown).
#[derive(Debug, Clone)]
pub struct SweeperHandle {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop and wait for it.
    ///
    /// Calling `shutdown` more than once is safe.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            tracing::warn!(error = %e, "cache sweeper task failed");
        }
    }

    /// `true` until the task has exited.
    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }
}
