//! Two-tier context store.
//!
//! The volatile tier (an in-process map) is authoritative for the lifetime of
//! the process. The optional durable tier holds one record per customer and is
//! written whenever a customer-keyed context changes. Session ids that have been
//! adopted by a customer resolve through an alias map to the customer key.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use concierge_core::durable::DurableStore;
use concierge_core::models::Context;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Where a `put` landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PutOutcome {
    Durable,
    VolatileOnly,
    DurableFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSummary {
    pub key: String,
    pub last_updated: DateTime<Utc>,
    pub durable: bool,
}

#[derive(Default)]
struct Tiers {
    volatile: HashMap<String, Context>,
    /// session id -> customer id
    aliases: HashMap<String, String>,
    /// Keys whose records belong in the durable tier.
    customer_keys: HashSet<String>,
    /// Keys whose durable read failed; their stored record is unknown.
    unread: HashSet<String>,
}

type LockMap = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

/// Held while one event for a key is handled. Dropping it releases the key
/// and forgets the lock once nobody else is waiting on it.
pub struct KeyGuard<'a> {
    locks: &'a LockMap,
    key: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        let ours = locks
            .get(&self.key)
            .is_some_and(|l| Arc::ptr_eq(l, &self.lock));
        // The map's handle and ours are the only ones left.
        if ours && Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.key);
        }
    }
}

pub struct ContextStore {
    tiers: Mutex<Tiers>,
    locks: LockMap,
    durable: Option<Arc<dyn DurableStore>>,
}

impl ContextStore {
    pub fn new(durable: Option<Arc<dyn DurableStore>>) -> Self {
        Self {
            tiers: Mutex::new(Tiers::default()),
            locks: Mutex::new(HashMap::new()),
            durable,
        }
    }

    pub fn volatile_only() -> Self {
        Self::new(None)
    }

    fn tiers(&self) -> MutexGuard<'_, Tiers> {
        self.tiers.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn durable_name(&self) -> Option<&str> {
        self.durable.as_deref().map(|d| d.name())
    }

    /// `"disabled"`, `"ok"` or `"unavailable"`.
    pub async fn durable_status(&self) -> &'static str {
        match &self.durable {
            None => "disabled",
            Some(d) => match d.ping().await {
                Ok(()) => "ok",
                Err(e) => {
                    tracing::warn!(backend = d.name(), error = %e, "Durable store ping failed");
                    "unavailable"
                }
            },
        }
    }

    /// Follow the alias map to the canonical key.
    pub fn resolve(&self, key: &str) -> String {
        self.tiers()
            .aliases
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    /// Per-key async mutex; hold the guard while handling one event.
    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let guard = lock.clone().lock_owned().await;
        KeyGuard {
            locks: &self.locks,
            key: key.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    /// Volatile hit, else durable read, else an empty context. Never fails.
    pub async fn get(&self, key: &str) -> Context {
        let canonical = self.resolve(key);
        let cached = self.tiers().volatile.get(&canonical).cloned();
        if let Some(ctx) = cached {
            return ctx;
        }

        let Some(durable) = &self.durable else {
            return Context::default();
        };

        match durable.load(&canonical).await {
            Ok(Some(record)) => {
                let ctx = Context::from_value(record.data);
                let mut tiers = self.tiers();
                tiers.unread.remove(&canonical);
                tiers.customer_keys.insert(canonical.clone());
                // A concurrent put may have landed while the read was in flight.
                tiers
                    .volatile
                    .entry(canonical)
                    .or_insert_with(|| ctx.clone())
                    .clone()
            }
            Ok(None) => {
                self.tiers().unread.remove(&canonical);
                Context::default()
            }
            Err(e) => {
                tracing::warn!(key = %canonical, error = %e, "Durable read failed, serving empty context");
                self.tiers().unread.insert(canonical);
                Context::default()
            }
        }
    }

    /// Overwrite the record under `key`. Customer-keyed records are also
    /// written to the durable tier; a durable failure is reported, not raised.
    pub async fn put(&self, key: &str, mut context: Context) -> PutOutcome {
        context.touch();
        let canonical = self.resolve(key);
        let (customer_keyed, unread) = {
            let mut tiers = self.tiers();
            let customer_keyed = tiers.customer_keys.contains(&canonical)
                || context.customer_id().as_deref() == Some(canonical.as_str());
            if customer_keyed {
                tiers.customer_keys.insert(canonical.clone());
            }
            tiers.volatile.insert(canonical.clone(), context.clone());
            (customer_keyed, tiers.unread.contains(&canonical))
        };

        let Some(durable) = &self.durable else {
            return PutOutcome::VolatileOnly;
        };
        if !customer_keyed {
            return PutOutcome::VolatileOnly;
        }

        // Never overwrite a stored record that was never read. Retry the read
        // and fold the volatile changes into whatever is stored.
        if unread {
            match durable.load(&canonical).await {
                Ok(stored) => {
                    if let Some(record) = stored {
                        let mut recovered = Context::from_value(record.data);
                        recovered.absorb(context);
                        context = recovered;
                    }
                    let mut tiers = self.tiers();
                    tiers.unread.remove(&canonical);
                    tiers.volatile.insert(canonical.clone(), context.clone());
                    tracing::info!(key = %canonical, "Durable record readable again");
                }
                Err(e) => {
                    tracing::warn!(key = %canonical, error = %e, "Durable record still unreadable, skipping write");
                    return PutOutcome::DurableFailed;
                }
            }
        }

        match durable.save(&canonical, &context.to_value()).await {
            Ok(()) => PutOutcome::Durable,
            Err(e) => {
                tracing::warn!(key = %canonical, error = %e, "Durable write failed, kept volatile copy");
                PutOutcome::DurableFailed
            }
        }
    }

    /// Remove a record from both tiers along with any aliases pointing at it.
    pub async fn delete(&self, key: &str) -> bool {
        let canonical = self.resolve(key);
        let existed = {
            let mut tiers = self.tiers();
            tiers.aliases.retain(|k, v| k != key && *v != canonical);
            tiers.customer_keys.remove(&canonical);
            tiers.unread.remove(&canonical);
            tiers.volatile.remove(&canonical).is_some()
        };

        let durable_existed = match &self.durable {
            Some(durable) => match durable.delete(&canonical).await {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(key = %canonical, error = %e, "Durable delete failed");
                    false
                }
            },
            None => false,
        };
        existed || durable_existed
    }

    /// Every known record, most recently updated first.
    pub async fn list(&self) -> Vec<ContextSummary> {
        let mut by_key: HashMap<String, ContextSummary> = self
            .tiers()
            .volatile
            .iter()
            .map(|(k, ctx)| {
                (
                    k.clone(),
                    ContextSummary {
                        key: k.clone(),
                        last_updated: ctx.last_updated,
                        durable: false,
                    },
                )
            })
            .collect();

        if let Some(durable) = &self.durable {
            match durable.list().await {
                Ok(rows) => {
                    for (key, updated_at) in rows {
                        by_key
                            .entry(key.clone())
                            .and_modify(|s| s.durable = true)
                            .or_insert(ContextSummary {
                                key,
                                last_updated: updated_at,
                                durable: true,
                            });
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Durable list failed, showing volatile records only"),
            }
        }

        let mut out: Vec<_> = by_key.into_values().collect();
        out.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        out
    }

    /// Clear the context but keep its role flag. Idempotent.
    pub async fn reset(&self, key: &str) -> (Context, PutOutcome) {
        let mut ctx = self.get(key).await;
        ctx.reset();
        let outcome = self.put(key, ctx.clone()).await;
        (ctx, outcome)
    }

    /// Move a session-keyed context under `customer_id`, merging it into any
    /// existing customer record. Afterwards both keys resolve to one record.
    pub async fn adopt_customer_key(&self, session_id: &str, customer_id: &str) -> (Context, PutOutcome) {
        self.adopt(session_id, customer_id, None).await
    }

    /// Adopt with a context the caller has been mutating but not yet stored;
    /// it supersedes the session's stored copy. When the session was bound to
    /// another customer, only this event's turns and the new identity move
    /// across and the previous customer's record is left as stored.
    pub async fn adopt_in_flight(
        &self,
        session_id: &str,
        customer_id: &str,
        in_flight: Context,
    ) -> (Context, PutOutcome) {
        self.adopt(session_id, customer_id, Some(in_flight)).await
    }

    async fn adopt(&self, session_id: &str, customer_id: &str, in_flight: Option<Context>) -> (Context, PutOutcome) {
        let already_bound = session_id == customer_id || self.resolve(session_id) == customer_id;
        if already_bound {
            self.tiers().customer_keys.insert(customer_id.to_string());
            let ctx = match in_flight {
                Some(ctx) => ctx,
                None => self.get(customer_id).await,
            };
            let outcome = self.put(customer_id, ctx.clone()).await;
            return (ctx, outcome);
        }

        let (previous_alias, stored) = {
            let mut tiers = self.tiers();
            let previous_alias = tiers.aliases.remove(session_id);
            // A session already bound to a customer carries no session-keyed record.
            let stored = match &previous_alias {
                Some(_) => None,
                None => tiers.volatile.remove(session_id),
            };
            (previous_alias, stored)
        };

        let carried = match (&previous_alias, in_flight) {
            (Some(previous), Some(ctx)) => {
                tracing::info!(session_id, from = %previous, to = %customer_id, "Session switched customer");
                let seen = self
                    .tiers()
                    .volatile
                    .get(previous)
                    .map_or(0, |c| c.history.len());
                Some(ctx.carry_over(seen))
            }
            (Some(previous), None) => {
                tracing::info!(session_id, from = %previous, to = %customer_id, "Session switched customer");
                None
            }
            (None, in_flight) => in_flight.or(stored),
        };

        let mut merged = self.get(customer_id).await;
        if let Some(session_ctx) = carried {
            merged.absorb(session_ctx);
        }

        {
            let mut tiers = self.tiers();
            tiers
                .aliases
                .insert(session_id.to_string(), customer_id.to_string());
            tiers.customer_keys.insert(customer_id.to_string());
        }

        let outcome = self.put(customer_id, merged.clone()).await;
        tracing::info!(session_id, customer_id, outcome = ?outcome, "Session context adopted by customer");
        (merged, outcome)
    }
}
