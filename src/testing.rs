//! Test doubles shared by the registry, middleware and handler tests.

use crate::driver::{ConnectOptions, DatabaseDriver, DocumentModel, DriverConnection, MemoryDriver};
use crate::error::DriverError;
use crate::schema::ModelSchema;
use crate::tenant::{StaticConfigSource, TenantConfig};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Memory driver that counts opens and can be slowed down or made to fail.
#[derive(Default)]
pub(crate) struct CountingDriver {
    inner: MemoryDriver,
    opens: AtomicUsize,
    defines: Arc<AtomicUsize>,
    failures_left: AtomicUsize,
    panics_left: AtomicUsize,
    delay_ms: AtomicU64,
    define_delay_ms: Arc<AtomicU64>,
    delay_by_uri: DashMap<String, u64>,
}

impl CountingDriver {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// `define_model` calls across every connection this driver opened.
    pub(crate) fn defines(&self) -> usize {
        self.defines.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub(crate) fn panic_next(&self, n: usize) {
        self.panics_left.store(n, Ordering::SeqCst);
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Slow down `define_model` on every connection, so concurrent definitions overlap.
    pub(crate) fn set_define_delay(&self, delay: Duration) {
        self.define_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub(crate) fn set_delay_for(&self, uri: &str, delay: Duration) {
        self.delay_by_uri.insert(uri.to_string(), delay.as_millis() as u64);
    }
}

#[async_trait]
impl DatabaseDriver for CountingDriver {
    fn validate_uri(&self, uri: &str) -> Result<(), String> {
        self.inner.validate_uri(uri)
    }

    async fn open(&self, uri: &str, options: &ConnectOptions) -> Result<Arc<dyn DriverConnection>, DriverError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let delay = self
            .delay_by_uri
            .get(uri)
            .map(|d| *d.value())
            .unwrap_or_else(|| self.delay_ms.load(Ordering::SeqCst));
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let panic = self
            .panics_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if panic {
            panic!("injected panic while opening {}", uri);
        }
        let fail = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(DriverError::Connect("injected failure".into()));
        }
        let inner = self.inner.open(uri, options).await?;
        Ok(Arc::new(CountingConnection {
            inner,
            defines: self.defines.clone(),
            define_delay_ms: self.define_delay_ms.clone(),
        }))
    }
}

struct CountingConnection {
    inner: Arc<dyn DriverConnection>,
    defines: Arc<AtomicUsize>,
    define_delay_ms: Arc<AtomicU64>,
}

#[async_trait]
impl DriverConnection for CountingConnection {
    fn model(&self, name: &str) -> Option<Arc<dyn DocumentModel>> {
        self.inner.model(name)
    }

    async fn define_model(&self, name: &str, schema: &ModelSchema) -> Result<Arc<dyn DocumentModel>, DriverError> {
        self.defines.fetch_add(1, Ordering::SeqCst);
        let delay = self.define_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.inner.define_model(name, schema).await
    }

    async fn ping(&self) -> Result<(), DriverError> {
        self.inner.ping().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

/// Config source mapping each tenant to `memory://<tenant>`.
pub(crate) fn memory_tenants(tenants: &[&str]) -> Arc<StaticConfigSource> {
    let source = tenants.iter().fold(StaticConfigSource::new(), |source, t| {
        source.with_tenant(*t, TenantConfig::with_uri(format!("memory://{}", t)))
    });
    Arc::new(source)
}
