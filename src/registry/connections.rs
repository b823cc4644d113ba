//! One live connection per tenant, opened lazily.
//!
//! Slots move `Pending -> Ready` on success and are removed on failure, so a failed
//! attempt is retried by the next request. Concurrent first requests for a tenant all
//! await the same attempt; the attempt runs on its own task so it settles even when
//! every caller has gone away.

use crate::driver::{redact_uri, ConnectOptions, DatabaseDriver, DriverConnection};
use crate::error::TenantError;
use crate::tenant::{TenantConfigSource, TenantId};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

#[derive(Clone, Debug)]
pub struct RegistryOptions {
    pub connect: ConnectOptions,
    /// Upper bound for loading the tenant config and opening the connection.
    pub open_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        RegistryOptions {
            connect: ConnectOptions::default(),
            open_timeout: Duration::from_secs(10),
        }
    }
}

/// An open tenant database connection. Shared by every request of the tenant.
pub struct TenantConnection {
    tenant_id: TenantId,
    handle: Arc<dyn DriverConnection>,
    opened_at: DateTime<Utc>,
    opened: Instant,
    /// Milliseconds after `opened` of the last registry hit.
    last_used_ms: AtomicU64,
    open: AtomicBool,
}

impl TenantConnection {
    fn new(tenant_id: TenantId, handle: Arc<dyn DriverConnection>) -> Self {
        TenantConnection {
            tenant_id,
            handle,
            opened_at: Utc::now(),
            opened: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            open: AtomicBool::new(true),
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn handle(&self) -> &Arc<dyn DriverConnection> {
        &self.handle
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn idle_for(&self) -> Duration {
        let used = Duration::from_millis(self.last_used_ms.load(Ordering::Relaxed));
        self.opened.elapsed().saturating_sub(used)
    }

    pub(crate) fn touch(&self) {
        let ms = self.opened.elapsed().as_millis() as u64;
        self.last_used_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub(crate) async fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.handle.close().await;
        }
    }
}

impl std::fmt::Debug for TenantConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantConnection")
            .field("tenant_id", &self.tenant_id)
            .field("opened_at", &self.opened_at)
            .field("open", &self.is_open())
            .finish()
    }
}

type Attempt = Shared<BoxFuture<'static, Result<Arc<TenantConnection>, TenantError>>>;

enum Slot {
    Ready(Arc<TenantConnection>),
    Pending { attempt: u64, waiter: Attempt },
}

impl Slot {
    fn is_attempt(&self, id: u64) -> bool {
        matches!(self, Slot::Pending { attempt, .. } if *attempt == id)
    }
}

/// Owns the attempt's sender. Dropped without `finish` (panic or task cancellation),
/// it clears the pending slot so the next request starts over.
struct AttemptGuard {
    inner: Arc<Inner>,
    tenant: TenantId,
    attempt: u64,
    tx: Option<oneshot::Sender<Result<Arc<TenantConnection>, TenantError>>>,
}

impl AttemptGuard {
    fn finish(mut self, outcome: Result<Arc<TenantConnection>, TenantError>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if self.tx.is_some() {
            let attempt = self.attempt;
            self.inner.slots.remove_if(&self.tenant, |_, slot| slot.is_attempt(attempt));
            tracing::warn!(tenant = %self.tenant, "tenant connection attempt aborted");
        }
    }
}

struct Inner {
    driver: Arc<dyn DatabaseDriver>,
    source: Arc<dyn TenantConfigSource>,
    options: RegistryOptions,
    slots: DashMap<TenantId, Slot>,
    next_attempt: AtomicU64,
    closed: AtomicBool,
}

pub struct TenantConnectionRegistry {
    inner: Arc<Inner>,
}

impl TenantConnectionRegistry {
    pub fn new(
        driver: Arc<dyn DatabaseDriver>,
        source: Arc<dyn TenantConfigSource>,
        options: RegistryOptions,
    ) -> Self {
        TenantConnectionRegistry {
            inner: Arc::new(Inner {
                driver,
                source,
                options,
                slots: DashMap::new(),
                next_attempt: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Return the tenant's connection, opening it on first use. Calls for different
    /// tenants never wait on each other.
    pub async fn get_connection(&self, tenant: &TenantId) -> Result<Arc<TenantConnection>, TenantError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(TenantError::RegistryClosed);
        }
        let (waiter, leader) = match self.inner.slots.entry(tenant.clone()) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Ready(conn) => {
                    conn.touch();
                    return Ok(conn.clone());
                }
                Slot::Pending { waiter, .. } => {
                    tracing::debug!(tenant = %tenant, "waiting on in-flight connection attempt");
                    (waiter.clone(), None)
                }
            },
            Entry::Vacant(entry) => {
                let attempt = self.inner.next_attempt.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                let aborted = tenant.clone();
                let waiter: Attempt = async move {
                    rx.await
                        .unwrap_or_else(|_| Err(TenantError::connection(&aborted, "connection attempt aborted")))
                }
                .boxed()
                .shared();
                entry.insert(Slot::Pending {
                    attempt,
                    waiter: waiter.clone(),
                });
                (waiter, Some((attempt, tx)))
            }
        };

        if let Some((attempt, tx)) = leader {
            let guard = AttemptGuard {
                inner: Arc::clone(&self.inner),
                tenant: tenant.clone(),
                attempt,
                tx: Some(tx),
            };
            tokio::spawn(async move {
                let outcome = guard.inner.establish(&guard.tenant).await;
                let outcome = guard.inner.settle(&guard.tenant, attempt, outcome).await;
                guard.finish(outcome);
            });
        }
        waiter.await
    }

    /// Current connection without opening one.
    pub fn connection(&self, tenant: &TenantId) -> Option<Arc<TenantConnection>> {
        match self.inner.slots.get(tenant)?.value() {
            Slot::Ready(conn) => Some(conn.clone()),
            Slot::Pending { .. } => None,
        }
    }

    /// Tenants with an open connection.
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut out: Vec<TenantId> = self
            .inner
            .slots
            .iter()
            .filter(|e| matches!(e.value(), Slot::Ready(_)))
            .map(|e| e.key().clone())
            .collect();
        out.sort();
        out
    }

    /// Drop the tenant's connection (closing it) or abandon its in-flight attempt.
    /// The next request opens a fresh connection. Returns whether anything was removed.
    pub async fn invalidate(&self, tenant: &TenantId) -> bool {
        match self.inner.slots.remove(tenant) {
            Some((_, Slot::Ready(conn))) => {
                conn.close().await;
                tracing::info!(tenant = %tenant, "tenant connection invalidated");
                true
            }
            Some((_, Slot::Pending { .. })) => {
                tracing::info!(tenant = %tenant, "in-flight tenant connection attempt invalidated");
                true
            }
            None => false,
        }
    }

    /// Close connections unused for at least `max_idle`. Returns the evicted tenants.
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<TenantId> {
        let candidates: Vec<TenantId> = self
            .inner
            .slots
            .iter()
            .filter(|e| matches!(e.value(), Slot::Ready(c) if c.idle_for() >= max_idle))
            .map(|e| e.key().clone())
            .collect();
        let mut evicted = Vec::new();
        for tenant in candidates {
            let removed = self
                .inner
                .slots
                .remove_if(&tenant, |_, slot| matches!(slot, Slot::Ready(c) if c.idle_for() >= max_idle));
            if let Some((_, Slot::Ready(conn))) = removed {
                conn.close().await;
                tracing::info!(tenant = %tenant, idle_secs = conn.idle_for().as_secs(), "idle tenant connection closed");
                evicted.push(tenant);
            }
        }
        evicted
    }

    /// Close every connection and refuse further requests.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let tenants: Vec<TenantId> = self.inner.slots.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0usize;
        for tenant in tenants {
            if let Some((_, Slot::Ready(conn))) = self.inner.slots.remove(&tenant) {
                conn.close().await;
                closed += 1;
            }
        }
        tracing::info!(closed, "tenant connection registry shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Inner {
    async fn establish(&self, tenant: &TenantId) -> Result<TenantConnection, TenantError> {
        let limit = self.options.open_timeout;
        match tokio::time::timeout(limit, self.open_tenant(tenant)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TenantError::connection(
                tenant,
                format!("timed out after {}ms", limit.as_millis()),
            )),
        }
    }

    async fn open_tenant(&self, tenant: &TenantId) -> Result<TenantConnection, TenantError> {
        let started = Instant::now();
        let config = self
            .source
            .load_tenant_config(tenant)
            .await?
            .ok_or_else(|| TenantError::ConfigNotFound(tenant.clone()))?;
        let uri = config
            .connection_uri
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| TenantError::config_invalid(tenant, "connection uri is missing"))?;
        self.driver
            .validate_uri(uri)
            .map_err(|reason| TenantError::config_invalid(tenant, reason))?;

        let mut options = self.options.connect.clone();
        if let Some(max) = config.max_connections {
            options.max_connections = max;
        }
        let handle = self
            .driver
            .open(uri, &options)
            .await
            .map_err(|e| TenantError::connection(tenant, e.to_string()))?;
        tracing::info!(
            tenant = %tenant,
            uri = %redact_uri(uri),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tenant connection opened"
        );
        Ok(TenantConnection::new(tenant.clone(), handle))
    }

    /// Record the attempt's outcome in the map before any waiter sees it.
    async fn settle(
        &self,
        tenant: &TenantId,
        attempt: u64,
        outcome: Result<TenantConnection, TenantError>,
    ) -> Result<Arc<TenantConnection>, TenantError> {
        let conn = match outcome {
            Ok(conn) => Arc::new(conn),
            Err(err) => {
                self.slots.remove_if(tenant, |_, slot| slot.is_attempt(attempt));
                tracing::warn!(tenant = %tenant, error = %err, "tenant connection attempt failed");
                return Err(err);
            }
        };

        let closed = self.closed.load(Ordering::Acquire);
        let installed = !closed
            && match self.slots.get_mut(tenant) {
                Some(mut slot) if slot.is_attempt(attempt) => {
                    *slot = Slot::Ready(conn.clone());
                    true
                }
                _ => false,
            };
        if installed {
            return Ok(conn);
        }

        self.slots.remove_if(tenant, |_, slot| slot.is_attempt(attempt));
        conn.close().await;
        if closed {
            Err(TenantError::RegistryClosed)
        } else {
            Err(TenantError::connection(tenant, "invalidated while connecting"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::{StaticConfigSource, TenantConfig};
    use crate::testing::{memory_tenants, CountingDriver};
    use futures::future::join_all;

    fn registry(driver: Arc<CountingDriver>, tenants: &[&str]) -> Arc<TenantConnectionRegistry> {
        Arc::new(TenantConnectionRegistry::new(
            driver,
            memory_tenants(tenants),
            RegistryOptions::default(),
        ))
    }

    #[tokio::test]
    async fn second_call_returns_cached_connection() {
        let driver = CountingDriver::new();
        let reg = registry(driver.clone(), &["brandx"]);
        let t = TenantId::from("brandx");

        let a = reg.get_connection(&t).await.unwrap();
        let b = reg.get_connection(&t).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(driver.opens(), 1);
        assert_eq!(a.tenant_id(), &t);
        assert_eq!(reg.tenants(), vec![t]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_requests_share_one_open() {
        let driver = CountingDriver::new();
        driver.set_delay(Duration::from_millis(100));
        let reg = registry(driver.clone(), &["brandx"]);

        let calls = (0..16).map(|_| {
            let reg = reg.clone();
            tokio::spawn(async move { reg.get_connection(&TenantId::from("brandx")).await })
        });
        let conns: Vec<Arc<TenantConnection>> = join_all(calls)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(driver.opens(), 1);
        assert!(conns.iter().all(|c| Arc::ptr_eq(c, &conns[0])));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiters_of_a_failed_attempt_all_see_the_error() {
        let driver = CountingDriver::new();
        driver.set_delay(Duration::from_millis(50));
        driver.fail_next(1);
        let reg = registry(driver.clone(), &["brandx"]);
        let t = TenantId::from("brandx");

        let results = join_all((0..8).map(|_| reg.get_connection(&t))).await;
        assert_eq!(driver.opens(), 1);
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(TenantError::Connection { reason, .. }) if reason.contains("injected"))));
    }

    #[tokio::test]
    async fn failed_attempt_is_retried_by_next_request() {
        let driver = CountingDriver::new();
        driver.fail_next(1);
        let reg = registry(driver.clone(), &["brandx"]);
        let t = TenantId::from("brandx");

        assert!(reg.get_connection(&t).await.is_err());
        assert!(reg.connection(&t).is_none());
        assert!(reg.tenants().is_empty());

        let conn = reg.get_connection(&t).await.unwrap();
        assert!(conn.is_open());
        assert_eq!(driver.opens(), 2);
    }

    #[tokio::test]
    async fn panicked_attempt_does_not_poison_the_tenant() {
        let driver = CountingDriver::new();
        driver.panic_next(1);
        let reg = registry(driver.clone(), &["brandx"]);
        let t = TenantId::from("brandx");

        let err = reg.get_connection(&t).await.unwrap_err();
        assert!(matches!(err, TenantError::Connection { ref reason, .. } if reason.contains("aborted")));
        assert!(reg.connection(&t).is_none());

        let conn = reg.get_connection(&t).await.unwrap();
        assert!(conn.is_open());
        assert_eq!(driver.opens(), 2);
    }

    #[tokio::test]
    async fn timed_out_attempt_clears_its_slot() {
        let driver = CountingDriver::new();
        driver.set_delay(Duration::from_secs(5));
        let reg = TenantConnectionRegistry::new(
            driver.clone(),
            memory_tenants(&["brandx"]),
            RegistryOptions {
                open_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        );
        let t = TenantId::from("brandx");

        let err = reg.get_connection(&t).await.unwrap_err();
        assert!(matches!(err, TenantError::Connection { ref reason, .. } if reason.contains("timed out")));

        driver.set_delay(Duration::ZERO);
        assert!(reg.get_connection(&t).await.is_ok());
        assert_eq!(driver.opens(), 2);
    }

    #[tokio::test]
    async fn missing_or_bad_config_is_reported_without_opening() {
        let driver = CountingDriver::new();
        let source = StaticConfigSource::new()
            .with_tenant("nouri", TenantConfig::default())
            .with_tenant("bad", TenantConfig::with_uri("not-a-uri"));
        let reg = TenantConnectionRegistry::new(driver.clone(), Arc::new(source), RegistryOptions::default());

        assert_eq!(
            reg.get_connection(&TenantId::from("ghost")).await.unwrap_err(),
            TenantError::ConfigNotFound(TenantId::from("ghost"))
        );
        assert!(matches!(
            reg.get_connection(&TenantId::from("nouri")).await,
            Err(TenantError::ConfigInvalid { .. })
        ));
        assert!(matches!(
            reg.get_connection(&TenantId::from("bad")).await,
            Err(TenantError::ConfigInvalid { .. })
        ));
        assert_eq!(driver.opens(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn slow_tenant_does_not_block_others() {
        let driver = CountingDriver::new();
        driver.set_delay_for("memory://slow", Duration::from_secs(2));
        let reg = registry(driver.clone(), &["slow", "fast"]);

        let slow = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.get_connection(&TenantId::from("slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fast = tokio::time::timeout(Duration::from_millis(500), reg.get_connection(&TenantId::from("fast")))
            .await
            .expect("fast tenant waited on slow tenant");
        assert!(fast.is_ok());
        slow.abort();
    }

    #[tokio::test]
    async fn invalidate_closes_and_next_call_reopens() {
        let driver = CountingDriver::new();
        let reg = registry(driver.clone(), &["brandx"]);
        let t = TenantId::from("brandx");

        let old = reg.get_connection(&t).await.unwrap();
        assert!(reg.invalidate(&t).await);
        assert!(!old.is_open());
        assert!(!reg.invalidate(&t).await);

        let new = reg.get_connection(&t).await.unwrap();
        assert!(!Arc::ptr_eq(&old, &new));
        assert_eq!(driver.opens(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalidating_an_in_flight_attempt_discards_its_connection() {
        let driver = CountingDriver::new();
        driver.set_delay(Duration::from_millis(100));
        let reg = registry(driver.clone(), &["brandx"]);
        let t = TenantId::from("brandx");

        let pending = {
            let reg = reg.clone();
            let t = t.clone();
            tokio::spawn(async move { reg.get_connection(&t).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(reg.invalidate(&t).await);

        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, Err(TenantError::Connection { .. })));
        assert!(reg.connection(&t).is_none());

        driver.set_delay(Duration::ZERO);
        assert!(reg.get_connection(&t).await.is_ok());
    }

    #[tokio::test]
    async fn evicts_only_idle_connections() {
        let driver = CountingDriver::new();
        let reg = registry(driver.clone(), &["brandx"]);
        let t = TenantId::from("brandx");
        let conn = reg.get_connection(&t).await.unwrap();

        assert!(reg.evict_idle(Duration::from_secs(60)).await.is_empty());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(reg.evict_idle(Duration::from_millis(10)).await, vec![t.clone()]);
        assert!(!conn.is_open());
        assert!(reg.connection(&t).is_none());
    }

    #[tokio::test]
    async fn shutdown_closes_everything_and_refuses_requests() {
        let driver = CountingDriver::new();
        let reg = registry(driver.clone(), &["brandx", "brandy"]);
        let x = reg.get_connection(&TenantId::from("brandx")).await.unwrap();
        let y = reg.get_connection(&TenantId::from("brandy")).await.unwrap();

        reg.shutdown().await;
        assert!(reg.is_closed());
        assert!(!x.is_open() && !y.is_open());
        assert!(reg.tenants().is_empty());
        assert_eq!(
            reg.get_connection(&TenantId::from("brandx")).await.unwrap_err(),
            TenantError::RegistryClosed
        );
    }
}
