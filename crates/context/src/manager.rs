//! Isolated store of live user execution contexts.

use crate::audit::{AuditEvent, AuditEventKind, AuditRecord, AuditSink};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use strata_core::{ContextConfig, ContextError, Metrics, SessionHandle, UserExecutionContext};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ContextSlot {
    context: UserExecutionContext,
    set_at: DateTime<Utc>,
    expires_at: Option<Instant>,
    generation: u64,
}

impl ContextSlot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

struct Inner {
    slots: DashMap<String, ContextSlot>,
    user_keys: DashMap<String, HashSet<String>>,
    session_owners: DashMap<SessionHandle, String>,
    audit: DashMap<String, AuditRecord>,
    generation: AtomicU64,
    config: ContextConfig,
    metrics: Arc<Metrics>,
    audit_sink: Arc<dyn AuditSink>,
}

/// Owns the table of live contexts.
///
/// Every table is sharded per key, so operations on unrelated keys or
/// users never wait on one another. Lock order is user -> slot -> session
/// handle; `set_context` and slot removal both follow it, every other path
/// takes one table at a time.
#[derive(Clone)]
pub struct UserContextManager {
    inner: Arc<Inner>,
}

impl UserContextManager {
    pub fn new(config: ContextConfig, metrics: Arc<Metrics>, audit_sink: Arc<dyn AuditSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                user_keys: DashMap::new(),
                session_owners: DashMap::new(),
                audit: DashMap::new(),
                generation: AtomicU64::new(0),
                config,
                metrics,
                audit_sink,
            }),
        }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.inner.config
    }

    /// Register `context` under `key`.
    ///
    /// TTL precedence: `ttl` argument, then `context.ttl`, then the configured default.
    ///
    /// # Errors
    /// * `InvalidContext` - empty key, or a context failing validation
    /// * `Isolation` - the key or the db session handle belongs to another registration
    /// * `ResourceLimit` - the user already holds the maximum number of contexts
    pub fn set_context(
        &self,
        key: &str,
        context: UserExecutionContext,
        ttl: Option<Duration>,
    ) -> Result<(), ContextError> {
        let user_id = context.user_id.clone();
        match self.try_set(key, context, ttl) {
            Ok(()) => {
                self.inner.metrics.inc_contexts_registered();
                self.inner
                    .audit_sink
                    .record(&AuditEvent::new(AuditEventKind::ContextSet, key, &user_id));
                debug!(key = %key, user_id = %user_id, "Context registered");
                Ok(())
            }
            Err(e) => {
                self.inner.metrics.inc_contexts_rejected();
                self.inner
                    .user_keys
                    .remove_if(&user_id, |_, keys| keys.is_empty());
                self.inner.audit_sink.record(
                    &AuditEvent::new(AuditEventKind::ContextRejected, key, &user_id)
                        .with_detail(e.to_string()),
                );
                warn!(key = %key, user_id = %user_id, error = %e, "Context registration rejected");
                Err(e)
            }
        }
    }

    fn try_set(
        &self,
        key: &str,
        context: UserExecutionContext,
        ttl: Option<Duration>,
    ) -> Result<(), ContextError> {
        if key.trim().is_empty() {
            return Err(ContextError::InvalidContext(
                "context key must be non-empty".to_string(),
            ));
        }
        context.validate()?;

        // Expired leftovers must neither block the key nor consume quota.
        self.purge_if_expired(key);
        self.purge_expired_for_user(&context.user_id);

        let ttl = ttl.or(context.ttl).or_else(|| self.inner.config.default_ttl());
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let set_at = Utc::now();
        let limit = self.inner.config.max_contexts_per_user;
        let user_id = context.user_id.clone();
        let new_handle = context.db_session;

        let replaced_handle = {
            let mut user_keys = self.inner.user_keys.entry(user_id.clone()).or_default();
            let slot_entry = self.inner.slots.entry(key.to_string());

            let previous_handle = match &slot_entry {
                Entry::Occupied(occupied) => {
                    let owner = &occupied.get().context.user_id;
                    if owner != &user_id {
                        return Err(ContextError::Isolation(format!(
                            "key '{}' is registered to a different user",
                            key
                        )));
                    }
                    occupied.get().context.db_session
                }
                Entry::Vacant(_) => None,
            };

            if !user_keys.contains(key) && user_keys.len() >= limit {
                return Err(ContextError::ResourceLimit {
                    user_id: user_id.clone(),
                    active: user_keys.len(),
                    limit,
                });
            }

            if let Some(handle) = context.db_session {
                match self.inner.session_owners.entry(handle) {
                    Entry::Occupied(owner) if owner.get() != key => {
                        return Err(ContextError::Isolation(format!(
                            "db session {} is already owned by another context",
                            handle
                        )));
                    }
                    Entry::Occupied(_) => {}
                    Entry::Vacant(vacant) => {
                        vacant.insert(key.to_string());
                    }
                }
            }

            let record = AuditRecord {
                key: key.to_string(),
                user_id: user_id.clone(),
                thread_id: context.thread_id.clone(),
                run_id: context.run_id.clone(),
                session_id: context.session_id.clone(),
                context_set_at: set_at,
                audit_fields: context.audit_metadata.clone(),
            };

            let slot = ContextSlot {
                context,
                set_at,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
                generation,
            };
            match slot_entry {
                Entry::Occupied(mut occupied) => {
                    occupied.insert(slot);
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(slot);
                }
            }
            user_keys.insert(key.to_string());
            self.inner.audit.insert(key.to_string(), record);

            previous_handle.filter(|old| Some(*old) != new_handle)
        };

        if let Some(old) = replaced_handle {
            self.inner
                .session_owners
                .remove_if(&old, |_, owner| owner == key);
        }

        if let Some(ttl) = ttl {
            self.schedule_expiry(key.to_string(), generation, ttl);
        }
        Ok(())
    }

    /// Fetch a copy of the context for `key`. Fails closed once the TTL has elapsed.
    pub fn get_context(&self, key: &str) -> Result<UserExecutionContext, ContextError> {
        let generation = {
            let slot = self
                .inner
                .slots
                .get(key)
                .ok_or_else(|| ContextError::NotFound(key.to_string()))?;
            if !slot.is_expired(Instant::now()) {
                return Ok(slot.context.clone());
            }
            slot.generation
        };

        self.expire(key, generation);
        Err(ContextError::Expired(key.to_string()))
    }

    /// Remove the context for `key`. Clearing a missing key is a no-op.
    pub fn clear_context(&self, key: &str) -> bool {
        match self.remove_slot(key, None) {
            Some(slot) => {
                self.inner.metrics.inc_contexts_cleared();
                self.inner.audit_sink.record(&AuditEvent::new(
                    AuditEventKind::ContextCleared,
                    key,
                    &slot.context.user_id,
                ));
                debug!(key = %key, "Context cleared");
                true
            }
            None => false,
        }
    }

    /// Snapshot of all live contexts. The returned map owns its data.
    pub fn get_active_contexts(&self) -> HashMap<String, UserExecutionContext> {
        let now = Instant::now();
        self.inner
            .slots
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| (entry.key().clone(), entry.value().context.clone()))
            .collect()
    }

    /// Copies of every live context owned by `user_id`.
    pub fn get_user_contexts(&self, user_id: &str) -> Vec<UserExecutionContext> {
        let keys: Vec<String> = match self.inner.user_keys.get(user_id) {
            Some(keys) => keys.iter().cloned().collect(),
            None => return Vec::new(),
        };
        keys.iter()
            .filter_map(|key| self.get_context(key).ok())
            .filter(|context| context.user_id == user_id)
            .collect()
    }

    /// Audit data for `key` only.
    pub fn get_audit_trail(&self, key: &str) -> Option<AuditRecord> {
        if !self.is_live(key) {
            return None;
        }
        self.inner.audit.get(key).map(|record| record.clone())
    }

    /// Audit data for `key`, visible only to the user who owns it.
    pub fn get_audit_trail_for(&self, requesting_user: &str, key: &str) -> Option<AuditRecord> {
        self.get_audit_trail(key)
            .filter(|record| record.user_id == requesting_user)
    }

    /// Owner-checked write into `agent_context`.
    pub fn update_agent_context(
        &self,
        key: &str,
        user_id: &str,
        field: &str,
        value: Value,
    ) -> Result<(), ContextError> {
        let mut slot = self
            .inner
            .slots
            .get_mut(key)
            .ok_or_else(|| ContextError::NotFound(key.to_string()))?;
        if slot.is_expired(Instant::now()) {
            return Err(ContextError::Expired(key.to_string()));
        }
        if slot.context.user_id != user_id {
            return Err(ContextError::Isolation(format!(
                "user '{}' does not own context '{}'",
                user_id, key
            )));
        }
        slot.context.agent_context.insert(field.to_string(), value);
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        let now = Instant::now();
        self.inner
            .slots
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .count()
    }

    pub fn user_context_count(&self, user_id: &str) -> usize {
        self.inner
            .user_keys
            .get(user_id)
            .map(|keys| keys.len())
            .unwrap_or(0)
    }

    /// Remove every expired context. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<(String, u64)> = self
            .inner
            .slots
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| (entry.key().clone(), entry.value().generation))
            .collect();

        let removed = expired
            .into_iter()
            .filter(|(key, generation)| self.expire(key, *generation))
            .count();
        if removed > 0 {
            info!(removed = removed, "Swept expired contexts");
        }
        removed
    }

    /// Run `sweep_expired` every `interval` until the manager is dropped.
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match Self::upgrade(&weak) {
                    Some(manager) => {
                        manager.sweep_expired();
                    }
                    None => break,
                }
            }
        })
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn is_live(&self, key: &str) -> bool {
        self.inner
            .slots
            .get(key)
            .is_some_and(|slot| !slot.is_expired(Instant::now()))
    }

    fn schedule_expiry(&self, key: String, generation: u64, ttl: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // Reads still fail closed without the timer.
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(manager) = Self::upgrade(&weak) {
                manager.expire(&key, generation);
            }
        });
    }

    /// Remove `key` if it still holds the registration `generation`.
    fn expire(&self, key: &str, generation: u64) -> bool {
        match self.remove_slot(key, Some(generation)) {
            Some(slot) => {
                self.inner.metrics.inc_contexts_expired();
                self.inner.audit_sink.record(&AuditEvent::new(
                    AuditEventKind::ContextExpired,
                    key,
                    &slot.context.user_id,
                ));
                warn!(key = %key, user_id = %slot.context.user_id, "Context expired");
                true
            }
            None => false,
        }
    }

    fn purge_if_expired(&self, key: &str) {
        let generation = match self.inner.slots.get(key) {
            Some(slot) if slot.is_expired(Instant::now()) => slot.generation,
            _ => return,
        };
        self.expire(key, generation);
    }

    fn purge_expired_for_user(&self, user_id: &str) {
        let keys: Vec<String> = match self.inner.user_keys.get(user_id) {
            Some(keys) => keys.iter().cloned().collect(),
            None => return,
        };
        for key in keys {
            self.purge_if_expired(&key);
        }
    }

    /// Remove the slot under `key` (only the given generation, if any) with
    /// its quota entry, session ownership and audit record.
    ///
    /// Takes the owner's `user_keys` entry before the slot, the same order as
    /// `set_context`, so a concurrent set of the same key cannot interleave.
    fn remove_slot(&self, key: &str, generation: Option<u64>) -> Option<ContextSlot> {
        let user_id = self.inner.slots.get(key)?.context.user_id.clone();

        let removed = {
            let mut user_keys = self.inner.user_keys.entry(user_id.clone()).or_default();
            let removed = self.inner.slots.remove_if(key, |_, slot| {
                slot.context.user_id == user_id
                    && generation.map_or(true, |generation| slot.generation == generation)
            });
            if let Some((_, slot)) = &removed {
                user_keys.remove(key);
                if let Some(handle) = slot.context.db_session {
                    self.inner
                        .session_owners
                        .remove_if(&handle, |_, owner| owner == key);
                }
                self.inner
                    .audit
                    .remove_if(key, |_, record| record.context_set_at == slot.set_at);
            }
            removed
        };
        self.inner
            .user_keys
            .remove_if(&user_id, |_, keys| keys.is_empty());

        let (_, slot) = removed?;
        debug!(key = %key, set_at = %slot.set_at, "Context slot removed");
        Some(slot)
    }
}
