//! Credential pool with per-slot cooldowns and round-robin rotation.
//!
//! All slot state lives behind a single mutex. Every mutation recomputes the
//! [`PoolStatus`], pushes it to subscribers and hands a usage snapshot to a
//! background writer, so a slow or failing usage store never delays selection.

use crate::gateway::types::{CredentialId, PoolConfig, PoolStatus};
use crate::gateway::usage_store::{UsageRecord, UsageSnapshot, UsageStore};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type StatusListener = Arc<dyn Fn(&PoolStatus) + Send + Sync>;
type ListenerMap = std::sync::Mutex<HashMap<Uuid, StatusListener>>;

#[derive(Debug, Clone)]
pub struct CredentialSlot {
    pub id: CredentialId,
    secret: Arc<SecretString>,
    pub usage_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub active: bool,
    /// Rejected by the provider as unauthorized; never selected again until reset
    pub disabled: bool,
}

impl CredentialSlot {
    fn new(id: CredentialId, secret: SecretString) -> Self {
        Self {
            id,
            secret: Arc::new(secret),
            usage_count: 0,
            last_used: None,
            cooldown_until: None,
            active: false,
            disabled: false,
        }
    }

    pub fn is_cooling_at(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        !self.disabled && !self.is_cooling_at(now)
    }

    fn lease(&self) -> CredentialLease {
        CredentialLease {
            id: self.id.clone(),
            secret: Arc::clone(&self.secret),
        }
    }

    fn to_record(&self) -> UsageRecord {
        UsageRecord {
            credential_hash: self.id.clone(),
            usage_count: self.usage_count,
            last_used: self.last_used,
            cooldown_until: self.cooldown_until,
            disabled: self.disabled,
        }
    }

    fn apply_record(&mut self, record: &UsageRecord) {
        self.usage_count = record.usage_count;
        self.last_used = record.last_used;
        self.cooldown_until = record.cooldown_until;
        self.disabled = record.disabled;
    }
}

/// Credential handed out for one attempt
#[derive(Debug, Clone)]
pub struct CredentialLease {
    pub id: CredentialId,
    pub secret: Arc<SecretString>,
}

#[derive(Debug, Clone)]
pub enum CredentialSelection {
    Ready(CredentialLease),
    /// Every selectable slot is cooling; this one frees up first
    AllCooling {
        lease: CredentialLease,
        available_at: DateTime<Utc>,
    },
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("credential already present")]
    Duplicate,
    #[error("credential has an invalid format")]
    InvalidFormat,
    #[error("invalid credential pattern: {0}")]
    InvalidPattern(String),
}

#[derive(Debug)]
struct PoolState {
    slots: Vec<CredentialSlot>,
    current: usize,
    period: NaiveDate,
    /// Persisted records for credentials not (yet) in the pool
    known_usage: HashMap<String, UsageRecord>,
}

impl PoolState {
    fn set_current(&mut self, index: usize) {
        self.current = index;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.active = i == index;
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.slots.iter().position(|slot| slot.id == id)
    }

    /// Usage counters belong to one UTC day
    fn roll_period(&mut self, now: DateTime<Utc>) -> bool {
        let today = now.date_naive();
        if today <= self.period {
            return false;
        }

        info!("Quota period rolled over to {}, resetting usage counters", today);
        self.period = today;
        for slot in &mut self.slots {
            slot.usage_count = 0;
        }
        for record in self.known_usage.values_mut() {
            record.usage_count = 0;
        }
        true
    }

    fn snapshot(&self) -> UsageSnapshot {
        let mut records: HashMap<String, UsageRecord> = self.known_usage.clone();
        for slot in &self.slots {
            records.insert(slot.id.clone(), slot.to_record());
        }

        let mut records: Vec<UsageRecord> = records.into_values().collect();
        records.sort_by(|a, b| a.credential_hash.cmp(&b.credential_hash));

        UsageSnapshot {
            period: Some(self.period),
            records,
        }
    }

    fn status_at(&self, now: DateTime<Utc>, quota: u64) -> PoolStatus {
        let total_slots = self.slots.len();
        let available_slots = self.slots.iter().filter(|s| s.is_usable_at(now)).count();
        let total_usage: u64 = self.slots.iter().map(|s| s.usage_count).sum();
        let capacity = total_slots as u64 * quota;
        let usage_ratio = if capacity == 0 {
            0.0
        } else {
            (total_usage as f64 / capacity as f64).min(1.0)
        };
        let next_available_at = self
            .slots
            .iter()
            .filter(|s| !s.disabled && s.is_cooling_at(now))
            .filter_map(|s| s.cooldown_until)
            .min();

        PoolStatus {
            total_slots,
            available_slots,
            usage_ratio,
            next_available_at,
            exhausted: total_slots > 0 && available_slots == 0,
        }
    }
}

/// Handle returned by [`CredentialPool::subscribe`]; dropping it unsubscribes
#[must_use = "dropping the subscription unsubscribes the listener"]
pub struct Subscription {
    id: Uuid,
    listeners: Weak<ListenerMap>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade()
            && let Ok(mut map) = listeners.lock()
        {
            map.remove(&self.id);
        }
    }
}

pub struct CredentialPool {
    config: PoolConfig,
    format: Regex,
    state: Arc<Mutex<PoolState>>,
    listeners: Arc<ListenerMap>,
    status_tx: watch::Sender<PoolStatus>,
    store: Option<Arc<dyn UsageStore>>,
    persist_tx: std::sync::Mutex<Option<watch::Sender<UsageSnapshot>>>,
    persist_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl CredentialPool {
    /// Build the pool, restore persisted usage and add the configured credentials.
    ///
    /// Malformed or duplicate credentials in the configuration are skipped with a
    /// warning; an unreadable usage store only costs the persisted counters.
    pub async fn new(
        config: PoolConfig,
        store: Option<Arc<dyn UsageStore>>,
    ) -> Result<Self, PoolError> {
        let format = Regex::new(&config.credential_pattern)
            .map_err(|e| PoolError::InvalidPattern(e.to_string()))?;

        let now = Utc::now();
        let mut state = PoolState {
            slots: Vec::new(),
            current: 0,
            period: now.date_naive(),
            known_usage: HashMap::new(),
        };

        if let Some(store) = &store {
            match store.load().await {
                Ok(snapshot) => {
                    state.period = snapshot.period.unwrap_or(state.period);
                    state.known_usage = snapshot
                        .records
                        .into_iter()
                        .map(|record| (record.credential_hash.clone(), record))
                        .collect();
                    state.roll_period(now);
                    debug!("Restored usage for {} credentials", state.known_usage.len());
                }
                Err(e) => warn!("Failed to load credential usage, starting fresh: {}", e),
            }
        }

        let initial_status = state.status_at(now, config.daily_quota_per_credential);
        let (status_tx, _) = watch::channel(initial_status);

        let (persist_tx, persist_task) = match &store {
            Some(store) => {
                let (tx, rx) = watch::channel(state.snapshot());
                let task = tokio::spawn(persist_usage_loop(Arc::clone(store), rx));
                (Some(tx), Some(task))
            }
            None => (None, None),
        };

        let pool = Self {
            config,
            format,
            state: Arc::new(Mutex::new(state)),
            listeners: Arc::new(std::sync::Mutex::new(HashMap::new())),
            status_tx,
            store,
            persist_tx: std::sync::Mutex::new(persist_tx),
            persist_task: std::sync::Mutex::new(persist_task),
        };

        for secret in pool.config.credentials.clone() {
            match pool.add_credential(&secret).await {
                Ok(id) => debug!("Loaded credential {}", id),
                Err(e) => warn!("Skipping configured credential: {}", e),
            }
        }

        Ok(pool)
    }

    pub async fn add_credential(&self, secret: &str) -> Result<CredentialId, PoolError> {
        let secret = secret.trim();
        if !self.format.is_match(secret) {
            return Err(PoolError::InvalidFormat);
        }

        let id = credential_id(secret);
        let mut state = self.state.lock().await;
        if state
            .slots
            .iter()
            .any(|slot| slot.id == id && slot.secret.expose_secret() == secret)
        {
            return Err(PoolError::Duplicate);
        }

        let mut slot = CredentialSlot::new(id.clone(), SecretString::from(secret.to_string()));
        if let Some(record) = state.known_usage.remove(&id) {
            slot.apply_record(&record);
        }
        state.slots.push(slot);
        if state.slots.len() == 1 {
            state.set_current(0);
        }

        info!("Added credential {} ({} total)", id, state.slots.len());
        self.publish(&state, Utc::now());
        Ok(id)
    }

    pub async fn remove_credential(&self, id: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(index) = state.position(id) else {
            return false;
        };

        let removed = state.slots.remove(index);
        state.known_usage.insert(removed.id.clone(), removed.to_record());

        let mut current = state.current;
        if index < current {
            current -= 1;
        }
        if current >= state.slots.len() {
            current = 0;
        }
        state.set_current(current);

        info!("Removed credential {} ({} left)", id, state.slots.len());
        self.publish(&state, Utc::now());
        true
    }

    pub async fn select_usable(&self) -> CredentialSelection {
        self.select_usable_at(Utc::now()).await
    }

    pub(crate) async fn select_usable_at(&self, now: DateTime<Utc>) -> CredentialSelection {
        let mut state = self.state.lock().await;
        if state.roll_period(now) {
            self.publish(&state, now);
        }

        if let Some(slot) = state.slots.get(state.current)
            && slot.is_usable_at(now)
        {
            return CredentialSelection::Ready(slot.lease());
        }

        if let Some(index) = state.slots.iter().position(|s| s.is_usable_at(now)) {
            debug!("Rotating to credential {}", state.slots[index].id);
            state.set_current(index);
            let lease = state.slots[index].lease();
            self.publish(&state, now);
            return CredentialSelection::Ready(lease);
        }

        // Ties keep the lowest index: min_by_key returns the first minimum
        state
            .slots
            .iter()
            .filter(|s| !s.disabled)
            .filter_map(|s| s.cooldown_until.map(|until| (until, s)))
            .min_by_key(|(until, _)| *until)
            .map(|(available_at, slot)| CredentialSelection::AllCooling {
                lease: slot.lease(),
                available_at,
            })
            .unwrap_or(CredentialSelection::Empty)
    }

    /// Whether a credential could be used right now without waiting
    pub async fn has_usable(&self) -> bool {
        let now = Utc::now();
        let state = self.state.lock().await;
        state.slots.iter().any(|s| s.is_usable_at(now))
    }

    pub async fn record_success(&self, id: &str) {
        self.record_success_at(id, Utc::now()).await
    }

    pub(crate) async fn record_success_at(&self, id: &str, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.roll_period(now);
        let Some(index) = state.position(id) else {
            return;
        };

        let slot = &mut state.slots[index];
        slot.usage_count += 1;
        slot.last_used = Some(now);
        if slot.cooldown_until.is_some_and(|until| until <= now) {
            slot.cooldown_until = None;
        }

        self.publish(&state, now);
    }

    /// Put a credential on cooldown and move "current" past it.
    ///
    /// Returns the cooldown expiry, or `None` for an unknown id.
    pub async fn record_rate_limit(
        &self,
        id: &str,
        cooldown: Option<Duration>,
    ) -> Option<DateTime<Utc>> {
        self.record_rate_limit_at(id, cooldown, Utc::now()).await
    }

    pub(crate) async fn record_rate_limit_at(
        &self,
        id: &str,
        cooldown: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let mut state = self.state.lock().await;
        let index = state.position(id)?;

        let cooldown = cooldown.unwrap_or(self.config.default_cooldown);
        let until = now
            + chrono::Duration::from_std(cooldown).unwrap_or_else(|_| chrono::Duration::days(365));
        state.slots[index].cooldown_until = Some(until);

        // Only advance when this slot is still current; a concurrent caller may
        // already have rotated away from it.
        if index == state.current {
            let next = (index + 1) % state.slots.len();
            state.set_current(next);
        }

        info!(
            "Credential {} cooling down until {}",
            id,
            until.format("%H:%M:%S%.3f")
        );
        self.publish(&state, now);
        Some(until)
    }

    pub async fn record_unauthorized(&self, id: &str) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let Some(index) = state.position(id) else {
            return;
        };

        state.slots[index].disabled = true;
        if index == state.current {
            let next = (index + 1) % state.slots.len();
            state.set_current(next);
        }

        warn!("Credential {} was rejected and is disabled", id);
        self.publish(&state, now);
    }

    pub async fn reset_usage(&self) {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        for slot in &mut state.slots {
            slot.usage_count = 0;
            slot.cooldown_until = None;
            slot.disabled = false;
        }
        state.known_usage.clear();

        info!("Credential usage reset");
        self.publish(&state, now);
    }

    pub async fn status(&self) -> PoolStatus {
        self.status_at(Utc::now()).await
    }

    pub(crate) async fn status_at(&self, now: DateTime<Utc>) -> PoolStatus {
        let mut state = self.state.lock().await;
        if state.roll_period(now) {
            self.publish(&state, now);
        }
        state.status_at(now, self.config.daily_quota_per_credential)
    }

    /// Slot snapshots in pool order (secrets stay behind `SecretString`)
    pub async fn slots(&self) -> Vec<CredentialSlot> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        if state.roll_period(now) {
            self.publish(&state, now);
        }
        state.slots.clone()
    }

    /// Register a listener; it immediately receives the latest status
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&PoolStatus) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        let listener: StatusListener = Arc::new(listener);
        listener(&*self.status_tx.borrow());

        if let Ok(mut map) = self.listeners.lock() {
            map.insert(id, listener);
        }

        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Latest-value stream of status snapshots
    pub fn watch_status(&self) -> watch::Receiver<PoolStatus> {
        self.status_tx.subscribe()
    }

    /// Stop the background writer and write the final snapshot
    pub async fn shutdown(&self) {
        let tx = self.persist_tx.lock().ok().and_then(|mut tx| tx.take());
        drop(tx);

        let task = self.persist_task.lock().ok().and_then(|mut task| task.take());
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!("Usage writer task failed: {}", e);
        }

        if let Some(store) = &self.store {
            let snapshot = self.state.lock().await.snapshot();
            if let Err(e) = store.save(&snapshot).await {
                warn!("Failed to save credential usage on shutdown: {}", e);
            }
        }
    }

    fn publish(&self, state: &PoolState, now: DateTime<Utc>) {
        let status = state.status_at(now, self.config.daily_quota_per_credential);
        self.status_tx.send_replace(status.clone());

        let listeners: Vec<StatusListener> = match self.listeners.lock() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        for listener in listeners {
            listener(&status);
        }

        if let Ok(tx) = self.persist_tx.lock()
            && let Some(tx) = tx.as_ref()
        {
            tx.send_replace(state.snapshot());
        }
    }
}

impl std::fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPool")
            .field("config", &self.config)
            .field("status", &*self.status_tx.borrow())
            .finish_non_exhaustive()
    }
}

/// Stable, non-reversible identifier for a credential
pub fn credential_id(secret: &str) -> CredentialId {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(digest)[..12].to_string()
}

async fn persist_usage_loop(store: Arc<dyn UsageStore>, mut rx: watch::Receiver<UsageSnapshot>) {
    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();
        if let Err(e) = store.save(&snapshot).await {
            warn!("Failed to persist credential usage: {}", e);
        }
    }
    debug!("Usage writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env;

    async fn pool_with(keys: &[&str]) -> CredentialPool {
        let config = PoolConfig {
            credentials: keys.iter().map(|k| k.to_string()).collect(),
            ..Default::default()
        };
        CredentialPool::new(config, None).await.unwrap()
    }

    fn key(n: usize) -> String {
        format!("test-key-{:0>16}", n)
    }

    #[tokio::test]
    async fn test_add_rejects_invalid_and_duplicate() {
        let pool = pool_with(&[]).await;

        assert_eq!(
            pool.add_credential("short").await,
            Err(PoolError::InvalidFormat)
        );
        assert!(pool.add_credential(env::test::VALID_TEST_KEY).await.is_ok());
        assert_eq!(
            pool.add_credential(env::test::VALID_TEST_KEY).await,
            Err(PoolError::Duplicate)
        );
        assert_eq!(pool.status().await.total_slots, 1);
    }

    #[tokio::test]
    async fn test_first_credential_becomes_active() {
        let pool = pool_with(&[env::test::VALID_TEST_KEY, env::test::OTHER_TEST_KEY]).await;
        let slots = pool.slots().await;

        assert!(slots[0].active);
        assert!(!slots[1].active);
        assert_eq!(slots.iter().filter(|s| s.active).count(), 1);
    }

    #[tokio::test]
    async fn test_cooling_credential_is_skipped() {
        let keys: Vec<String> = (0..3).map(key).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let pool = pool_with(&refs).await;
        let ids: Vec<String> = keys.iter().map(|k| credential_id(k)).collect();
        let now = Utc::now();

        pool.record_rate_limit_at(&ids[0], Some(Duration::from_secs(30)), now)
            .await;

        for offset in [0, 10, 29] {
            let at = now + chrono::Duration::seconds(offset);
            match pool.select_usable_at(at).await {
                CredentialSelection::Ready(lease) => assert_ne!(lease.id, ids[0]),
                other => panic!("expected a ready credential, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_all_cooling_returns_soonest_without_marking_current() {
        let keys: Vec<String> = (0..3).map(key).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let pool = pool_with(&refs).await;
        let ids: Vec<String> = keys.iter().map(|k| credential_id(k)).collect();
        let now = Utc::now();

        pool.record_rate_limit_at(&ids[0], Some(Duration::from_secs(50)), now)
            .await;
        pool.record_rate_limit_at(&ids[1], Some(Duration::from_secs(20)), now)
            .await;
        pool.record_rate_limit_at(&ids[2], Some(Duration::from_secs(40)), now)
            .await;
        let current_before: Vec<bool> = pool.slots().await.iter().map(|s| s.active).collect();

        match pool.select_usable_at(now).await {
            CredentialSelection::AllCooling {
                lease,
                available_at,
            } => {
                assert_eq!(lease.id, ids[1]);
                assert_eq!(available_at, now + chrono::Duration::seconds(20));
            }
            other => panic!("expected AllCooling, got {:?}", other),
        }

        let current_after: Vec<bool> = pool.slots().await.iter().map(|s| s.active).collect();
        assert_eq!(current_before, current_after);
    }

    #[tokio::test]
    async fn test_all_cooling_tie_breaks_on_lowest_index() {
        let keys: Vec<String> = (0..3).map(key).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let pool = pool_with(&refs).await;
        let ids: Vec<String> = keys.iter().map(|k| credential_id(k)).collect();
        let now = Utc::now();

        for id in ids.iter().rev() {
            pool.record_rate_limit_at(id, Some(Duration::from_secs(10)), now)
                .await;
        }

        match pool.select_usable_at(now).await {
            CredentialSelection::AllCooling { lease, .. } => assert_eq!(lease.id, ids[0]),
            other => panic!("expected AllCooling, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cooldown_expires() {
        let pool = pool_with(&[env::test::VALID_TEST_KEY]).await;
        let id = credential_id(env::test::VALID_TEST_KEY);
        let now = Utc::now();

        pool.record_rate_limit_at(&id, Some(Duration::from_secs(5)), now)
            .await;
        assert!(matches!(
            pool.select_usable_at(now + chrono::Duration::seconds(4)).await,
            CredentialSelection::AllCooling { .. }
        ));
        assert!(matches!(
            pool.select_usable_at(now + chrono::Duration::seconds(5)).await,
            CredentialSelection::Ready(_)
        ));

        pool.record_success_at(&id, now + chrono::Duration::seconds(6))
            .await;
        assert!(pool.slots().await[0].cooldown_until.is_none());
    }

    #[tokio::test]
    async fn test_remove_reclamps_current() {
        let keys: Vec<String> = (0..3).map(key).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let pool = pool_with(&refs).await;
        let ids: Vec<String> = keys.iter().map(|k| credential_id(k)).collect();

        // Make the last slot current
        pool.record_rate_limit(&ids[0], None).await;
        pool.record_rate_limit(&ids[1], None).await;
        assert!(pool.slots().await[2].active);

        assert!(pool.remove_credential(&ids[2]).await);
        assert!(!pool.remove_credential(&ids[2]).await);

        let slots = pool.slots().await;
        assert_eq!(slots.len(), 2);
        assert!(slots[0].active);
    }

    #[tokio::test]
    async fn test_empty_pool_selects_nothing() {
        let pool = pool_with(&[]).await;
        assert!(matches!(
            pool.select_usable().await,
            CredentialSelection::Empty
        ));

        let status = pool.status().await;
        assert_eq!(status.total_slots, 0);
        assert!(!status.exhausted);
    }

    #[tokio::test]
    async fn test_unauthorized_credential_is_never_selected() {
        let pool = pool_with(&[env::test::VALID_TEST_KEY]).await;
        let id = credential_id(env::test::VALID_TEST_KEY);

        pool.record_unauthorized(&id).await;
        assert!(matches!(
            pool.select_usable().await,
            CredentialSelection::Empty
        ));

        pool.reset_usage().await;
        assert!(matches!(
            pool.select_usable().await,
            CredentialSelection::Ready(_)
        ));
    }

    #[tokio::test]
    async fn test_status_and_subscribers() {
        let pool = pool_with(&[env::test::VALID_TEST_KEY, env::test::OTHER_TEST_KEY]).await;
        let id = credential_id(env::test::VALID_TEST_KEY);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = pool.subscribe(move |status| {
            sink.lock().unwrap().push(status.clone());
        });

        pool.record_success(&id).await;
        pool.record_rate_limit(&id, Some(Duration::from_secs(60)))
            .await;

        {
            let seen = seen.lock().unwrap();
            // Initial delivery plus two mutations
            assert_eq!(seen.len(), 3);
            let last = seen.last().unwrap();
            assert_eq!(last.total_slots, 2);
            assert_eq!(last.available_slots, 1);
            assert!(last.next_available_at.is_some());
            assert!(!last.exhausted);
        }

        subscription.unsubscribe();
        pool.reset_usage().await;
        assert_eq!(seen.lock().unwrap().len(), 3);

        let status = pool.status().await;
        assert_eq!(status.available_slots, 2);
        assert_eq!(status.usage_ratio, 0.0);
    }

    #[tokio::test]
    async fn test_usage_ratio() {
        let config = PoolConfig {
            credentials: vec![env::test::VALID_TEST_KEY.to_string()],
            daily_quota_per_credential: 4,
            ..Default::default()
        };
        let pool = CredentialPool::new(config, None).await.unwrap();
        let id = credential_id(env::test::VALID_TEST_KEY);

        pool.record_success(&id).await;
        assert_eq!(pool.status().await.usage_ratio, 0.25);

        for _ in 0..10 {
            pool.record_success(&id).await;
        }
        assert_eq!(pool.status().await.usage_ratio, 1.0);
    }

    #[tokio::test]
    async fn test_usage_resets_on_new_day_without_further_calls() {
        let config = PoolConfig {
            credentials: vec![env::test::VALID_TEST_KEY.to_string()],
            daily_quota_per_credential: 4,
            ..Default::default()
        };
        let pool = CredentialPool::new(config, None).await.unwrap();
        let id = credential_id(env::test::VALID_TEST_KEY);
        let mut status_rx = pool.watch_status();

        let now = Utc::now();
        for _ in 0..3 {
            pool.record_success_at(&id, now).await;
        }
        assert_eq!(pool.status_at(now).await.usage_ratio, 0.75);

        let tomorrow = now + chrono::Duration::days(1);
        let status = pool.status_at(tomorrow).await;
        assert_eq!(status.usage_ratio, 0.0);
        assert_eq!(status_rx.borrow_and_update().usage_ratio, 0.0);

        // Reading an earlier time again does not bring the old counters back
        assert_eq!(pool.status_at(now).await.usage_ratio, 0.0);
        assert_eq!(pool.slots().await[0].usage_count, 0);
    }

    #[tokio::test]
    async fn test_selection_rolls_usage_period() {
        let pool = pool_with(&[env::test::VALID_TEST_KEY]).await;
        let id = credential_id(env::test::VALID_TEST_KEY);
        let now = Utc::now();
        pool.record_success_at(&id, now).await;

        let selection = pool.select_usable_at(now + chrono::Duration::days(2)).await;
        assert!(matches!(selection, CredentialSelection::Ready(_)));
        assert_eq!(pool.slots().await[0].usage_count, 0);
    }

    #[test]
    fn test_credential_id_is_stable_and_opaque() {
        let id = credential_id(env::test::VALID_TEST_KEY);
        assert_eq!(id.len(), 12);
        assert_eq!(id, credential_id(env::test::VALID_TEST_KEY));
        assert!(!env::test::VALID_TEST_KEY.contains(&id));
    }
}
