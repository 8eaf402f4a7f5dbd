//! Claim-check store: hand out a claim number now, deposit the result later,
//! let a separate request withdraw it by claim or alias key.

mod admin;
mod drawer;
mod memory;
mod progress;
mod withdrawal;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crate::config;
use crate::logging::{LogLevel, Logger};
use crate::publish::Publishable;
use crate::schedule::{FixedDelayTask, ScheduleError};

pub use admin::{AdminCounts, AdminInfo};
pub use drawer::Expiration;
pub use memory::{MemoryProbe, MemoryRule, MemorySample, SystemMemoryProbe};
pub use progress::{ProgressIndicator, UnitCounter, UnitStatus};
pub use withdrawal::{Withdrawal, WithdrawalStatus};

use drawer::{millis, Drawer};

pub const DEFAULT_HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq)]
pub struct ClaimCheckConfig {
    /// Delay between housekeeping sweeps; zero disables the background sweep.
    pub housekeeping_interval: Duration,
    pub memory_rule: MemoryRule,
}

impl Default for ClaimCheckConfig {
    fn default() -> Self {
        Self {
            housekeeping_interval: DEFAULT_HOUSEKEEPING_INTERVAL,
            memory_rule: MemoryRule::default(),
        }
    }
}

impl TryFrom<config::ClaimCheckConfig> for ClaimCheckConfig {
    type Error = ClaimCheckError;

    fn try_from(value: config::ClaimCheckConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            housekeeping_interval: Duration::from_millis(value.housekeeping_interval_ms),
            memory_rule: MemoryRule::from_config(&value.memory_rule, value.memory_fraction)?,
        })
    }
}

#[derive(Debug)]
pub enum ClaimCheckError {
    InvalidMemoryRule { rule: String },
    InvalidMemoryFraction { fraction: f64 },
    Schedule(ScheduleError),
}

impl fmt::Display for ClaimCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMemoryRule { rule } => write!(
                f,
                "unknown memory rule '{rule}' (expected used_above, free_below or disabled)"
            ),
            Self::InvalidMemoryFraction { fraction } => {
                write!(f, "memory fraction {fraction} is outside 0.0..=1.0")
            }
            Self::Schedule(source) => write!(f, "{source}"),
        }
    }
}

impl std::error::Error for ClaimCheckError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Schedule(source) => Some(source),
            _ => None,
        }
    }
}

impl From<ScheduleError> for ClaimCheckError {
    fn from(value: ScheduleError) -> Self {
        Self::Schedule(value)
    }
}

pub struct ClaimCheckStore<T> {
    inner: Arc<StoreInner<T>>,
    housekeeper: Mutex<Option<FixedDelayTask>>,
}

struct StoreInner<T> {
    next_claim: AtomicU64,
    state: RwLock<Drawers<T>>,
    /// Bumped under the write lock by every mutation; keys the admin cache.
    generation: AtomicU64,
    admin_cache: Mutex<Option<(u64, Arc<AdminInfo<T>>)>>,
    memory_rule: MemoryRule,
    probe: Box<dyn MemoryProbe>,
    logger: Arc<Logger>,
}

struct Drawers<T> {
    drawers: HashMap<u64, Drawer<T>>,
    keys: HashMap<String, u64>,
}

impl<T> ClaimCheckStore<T>
where
    T: Publishable + 'static,
{
    pub fn new(config: ClaimCheckConfig, logger: Arc<Logger>) -> Result<Self, ClaimCheckError> {
        Self::with_probe(config, logger, Box::new(SystemMemoryProbe::new()))
    }

    pub fn from_app_config(
        app_config: &config::AppConfig,
        logger: Arc<Logger>,
    ) -> Result<Self, ClaimCheckError> {
        Self::new(
            ClaimCheckConfig::try_from(app_config.claim_check.clone())?,
            logger,
        )
    }

    pub fn with_probe(
        config: ClaimCheckConfig,
        logger: Arc<Logger>,
        probe: Box<dyn MemoryProbe>,
    ) -> Result<Self, ClaimCheckError> {
        let inner = Arc::new(StoreInner {
            next_claim: AtomicU64::new(0),
            state: RwLock::new(Drawers {
                drawers: HashMap::new(),
                keys: HashMap::new(),
            }),
            generation: AtomicU64::new(0),
            admin_cache: Mutex::new(None),
            memory_rule: config.memory_rule,
            probe,
            logger,
        });

        let housekeeper = if config.housekeeping_interval.is_zero() {
            None
        } else {
            let sweeper = Arc::clone(&inner);
            Some(FixedDelayTask::start(
                "claimcheck-housekeeping",
                config.housekeeping_interval,
                move || {
                    sweeper.clean_house_at(now_ms());
                },
            )?)
        };

        inner.logger.log(
            LogLevel::Debug,
            Some("claimcheck"),
            "claim-check store ready",
            Some(json!({
                "housekeeping_interval_ms": millis(config.housekeeping_interval),
                "memory_rule": format!("{:?}", config.memory_rule),
            })),
        );

        Ok(Self {
            inner,
            housekeeper: Mutex::new(housekeeper),
        })
    }

    /// Issues the next claim number and opens an empty drawer for it.
    pub fn reserve_drawer(
        &self,
        expiration: Expiration,
        key: Option<&str>,
        progress: Option<Arc<dyn ProgressIndicator>>,
    ) -> u64 {
        self.inner.reserve_at(expiration, key, progress, now_ms())
    }

    pub fn lookup_key(&self, key: &str) -> Option<u64> {
        self.inner.read().keys.get(key).copied()
    }

    pub fn was_reserved(&self, claim: u64) -> bool {
        claim < self.inner.next_claim.load(Ordering::SeqCst)
    }

    pub fn total_drawer_count(&self) -> u64 {
        self.inner.next_claim.load(Ordering::SeqCst)
    }

    pub fn progress(&self, claim: u64) -> Option<Arc<dyn ProgressIndicator>> {
        self.inner
            .read()
            .drawers
            .get(&claim)
            .and_then(|drawer| drawer.progress().cloned())
    }

    /// False when the drawer no longer exists.
    pub fn deposit(&self, claim: u64, content: T) -> bool {
        self.inner.deposit_at(claim, content, now_ms())
    }

    pub fn withdraw(&self, claim: u64, close_box: bool) -> Withdrawal<T> {
        self.inner.withdraw_at(claim, close_box, now_ms())
    }

    /// `None` when the key was never given to a reservation (or its drawer
    /// has since been swept).
    pub fn withdraw_key(&self, key: &str, close_box: bool) -> Option<Withdrawal<T>> {
        self.inner.withdraw_key_at(key, close_box, now_ms())
    }

    /// Reads a keyed drawer's content without counting as a withdrawal.
    pub fn contents_peek(&self, key: &str) -> Option<Arc<T>> {
        let state = self.inner.read();
        let claim = state.keys.get(key)?;
        state.drawers.get(claim)?.peek()
    }

    pub fn incinerate(&self, claim: u64) -> bool {
        self.inner.incinerate(claim)
    }

    pub fn incinerate_key(&self, key: &str) -> bool {
        match self.lookup_key(key) {
            Some(claim) => self.inner.incinerate(claim),
            None => false,
        }
    }

    /// Removes every drawer reserved more than `age` ago.
    pub fn incinerate_older(&self, age: Duration) -> usize {
        self.inner.incinerate_older_at(age, now_ms())
    }

    pub fn clean_house(&self) -> usize {
        self.inner.clean_house_at(now_ms())
    }

    pub fn admin_info(&self) -> Arc<AdminInfo<T>> {
        self.inner.admin_info()
    }

    /// Stops the housekeeping sweep. `now` does not wait for a sweep in progress.
    pub fn shutdown(&self, now: bool) -> Result<(), ClaimCheckError> {
        let housekeeper = self
            .housekeeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut task) = housekeeper {
            if now {
                task.cancel();
            } else {
                task.stop()?;
            }
        }
        Ok(())
    }

    pub fn is_housekeeping(&self) -> bool {
        self.housekeeper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(FixedDelayTask::is_running)
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(crate) fn reserve_drawer_at(&self, expiration: Expiration, key: Option<&str>, now: i64) -> u64 {
        self.inner.reserve_at(expiration, key, None, now)
    }

    #[cfg(test)]
    pub(crate) fn deposit_at(&self, claim: u64, content: T, now: i64) -> bool {
        self.inner.deposit_at(claim, content, now)
    }

    #[cfg(test)]
    pub(crate) fn withdraw_at(&self, claim: u64, close_box: bool, now: i64) -> Withdrawal<T> {
        self.inner.withdraw_at(claim, close_box, now)
    }

    #[cfg(test)]
    pub(crate) fn clean_house_at(&self, now: i64) -> usize {
        self.inner.clean_house_at(now)
    }

    #[cfg(test)]
    pub(crate) fn incinerate_older_at(&self, age: Duration, now: i64) -> usize {
        self.inner.incinerate_older_at(age, now)
    }
}

impl<T> StoreInner<T>
where
    T: Publishable + 'static,
{
    fn read(&self) -> RwLockReadGuard<'_, Drawers<T>> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Drawers<T>> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn touch(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn reserve_at(
        &self,
        expiration: Expiration,
        key: Option<&str>,
        progress: Option<Arc<dyn ProgressIndicator>>,
        now: i64,
    ) -> u64 {
        let mut state = self.write();
        let claim = self.next_claim.fetch_add(1, Ordering::SeqCst);
        state
            .drawers
            .insert(claim, Drawer::new(expiration, progress, now));
        if let Some(key) = key {
            state.keys.insert(key.to_owned(), claim);
        }
        self.touch();
        claim
    }

    fn deposit_at(&self, claim: u64, content: T, now: i64) -> bool {
        let mut state = self.write();
        match state.drawers.get_mut(&claim) {
            Some(drawer) => {
                drawer.deposit(content, now);
                self.touch();
                true
            }
            None => false,
        }
    }

    fn withdraw_at(&self, claim: u64, close_box: bool, now: i64) -> Withdrawal<T> {
        let mut state = self.write();
        self.withdraw_locked(&mut state, claim, close_box, now)
    }

    fn withdraw_key_at(&self, key: &str, close_box: bool, now: i64) -> Option<Withdrawal<T>> {
        let mut state = self.write();
        let claim = *state.keys.get(key)?;
        Some(self.withdraw_locked(&mut state, claim, close_box, now))
    }

    /// Status classification and one-shot removal happen under one write
    /// lock, so only one closing caller can see `Retrieved`.
    fn withdraw_locked(
        &self,
        state: &mut Drawers<T>,
        claim: u64,
        close_box: bool,
        now: i64,
    ) -> Withdrawal<T> {
        let Some(drawer) = state.drawers.get_mut(&claim) else {
            let status = if claim < self.next_claim.load(Ordering::SeqCst) {
                WithdrawalStatus::Expired
            } else {
                WithdrawalStatus::Unreserved
            };
            return Withdrawal::missing(claim, status);
        };

        let content = drawer.take_contents(now);
        let closing = close_box && content.is_some();
        let expires_at = if closing { now } else { drawer.expires_at() };
        let withdrawal = drawer.snapshot(claim, content, expires_at);

        if closing {
            state.drawers.remove(&claim);
        }
        self.touch();
        withdrawal
    }

    fn incinerate(&self, claim: u64) -> bool {
        let mut state = self.write();
        let removed = state.drawers.remove(&claim).is_some();
        if removed {
            self.touch();
        }
        removed
    }

    fn incinerate_older_at(&self, age: Duration, now: i64) -> usize {
        let age = millis(age);
        let mut state = self.write();
        let before = state.drawers.len();
        state
            .drawers
            .retain(|_, drawer| now.saturating_sub(drawer.opened_at()) <= age);
        let removed = before - state.drawers.len();
        if removed > 0 {
            self.touch();
        }
        drop(state);

        if removed > 0 {
            self.logger.log(
                LogLevel::Info,
                Some("claimcheck"),
                "incinerated old drawers",
                Some(json!({ "removed": removed, "older_than_ms": age })),
            );
        }
        removed
    }

    fn clean_house_at(&self, now: i64) -> usize {
        let sample = self.probe.sample();
        let memory_pressure = self.memory_rule.is_under_pressure(&sample);

        let mut state = self.write();
        let before = state.drawers.len();
        let Drawers { drawers, keys } = &mut *state;
        drawers.retain(|_, drawer| !drawer.should_incinerate(now, memory_pressure));
        keys.retain(|_, claim| drawers.contains_key(&*claim));
        let evicted = before - drawers.len();
        let active = drawers.len();
        self.touch();
        drop(state);

        if evicted > 0 {
            self.logger.log(
                LogLevel::Info,
                Some("claimcheck::housekeeping"),
                "incinerated drawers",
                Some(json!({
                    "evicted": evicted,
                    "active": active,
                    "memory_pressure": memory_pressure,
                    "available_bytes": sample.available_bytes,
                    "threshold": self.memory_rule.describe(sample.total_bytes),
                })),
            );
        }
        evicted
    }

    fn admin_info(&self) -> Arc<AdminInfo<T>> {
        let state = self.read();
        let generation = self.generation.load(Ordering::SeqCst);
        if let Some((cached_generation, info)) = &*self.admin_cache() {
            if *cached_generation == generation {
                return Arc::clone(info);
            }
        }

        let withdrawals: BTreeMap<u64, Withdrawal<T>> = state
            .drawers
            .iter()
            .map(|(claim, drawer)| {
                (
                    *claim,
                    drawer.snapshot(*claim, drawer.peek(), drawer.expires_at()),
                )
            })
            .collect();
        let filled_drawers = state
            .drawers
            .values()
            .filter(|drawer| drawer.has_deposit())
            .count() as u64;
        let key_to_claim: BTreeMap<String, u64> = state
            .keys
            .iter()
            .map(|(key, claim)| (key.clone(), *claim))
            .collect();
        let filled_keys = key_to_claim
            .iter()
            .filter(|(_, claim)| {
                state
                    .drawers
                    .get(*claim)
                    .map(Drawer::has_deposit)
                    .unwrap_or(false)
            })
            .map(|(key, _)| key.clone())
            .collect();
        let sample = self.probe.sample();

        let info = Arc::new(AdminInfo {
            total_drawers: self.next_claim.load(Ordering::SeqCst),
            active_drawers: state.drawers.len() as u64,
            filled_drawers,
            filled_keys,
            key_to_claim,
            withdrawals,
            free_memory_bytes: sample.available_bytes,
            memory_threshold: self.memory_rule.describe(sample.total_bytes),
            current_time_ms: now_ms(),
        });
        drop(state);

        *self.admin_cache() = Some((generation, Arc::clone(&info)));
        info
    }

    fn admin_cache(&self) -> MutexGuard<'_, Option<(u64, Arc<AdminInfo<T>>)>> {
        self.admin_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
