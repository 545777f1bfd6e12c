//! Instance pools
//!
//! A pool is the only concurrency boundary in front of PDFium. Callers take
//! a [`Lease`] with a timeout, run operations through it and drop it. Two
//! shapes exist:
//!
//! ```text
//! ExclusivePool                      MultiPool
//! ┌──────────────────────┐           ┌────────────────────────────────┐
//! │ Library (refcounted) │           │ idle: [slot, slot, ...]        │
//! │   Mutex<Instance>    │           │ Condvar wakes waiting callers  │
//! │ get_instance = lock  │           │ get_instance = pop or wait     │
//! └──────────────────────┘           └────────────────────────────────┘
//! ```
//!
//! Releasing a lease closes every document opened through it, so the next
//! holder of the same instance starts clean.

mod exclusive;
mod multi;

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

pub use exclusive::ExclusivePool;
pub use multi::MultiPool;

use crate::config::{Config, PoolKind};
use crate::error::Result;
use crate::instance::{NativeInstance, Pdfium};
use crate::native::{load_backend, Library};
use crate::worker::WorkerInstance;

/// Leased, timeout-bounded access to PDFium instances
pub trait Pool: Send + Sync {
    /// Wait up to `timeout` for an instance
    ///
    /// Fails with [`Timeout`](crate::PdfiumError::Timeout) when none frees
    /// up in time and with [`PoolClosed`](crate::PdfiumError::PoolClosed)
    /// after [`close`](Pool::close).
    fn get_instance(&self, timeout: Duration) -> Result<Lease<'_>>;

    /// Stop leasing, shut down every instance and release the library
    fn close(&self) -> Result<()>;

    fn stats(&self) -> PoolStats;
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Total instances ever created
    pub created: usize,
    /// Currently leased
    pub active: usize,
    /// Idle and ready to lease
    pub available: usize,
    pub max_size: usize,
    /// Instances dropped because they became unhealthy
    pub evicted: usize,
}

/// Creates the instances of a [`MultiPool`]
pub trait InstanceFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn Pdfium>>;
}

impl<F> InstanceFactory for F
where
    F: Fn() -> Result<Box<dyn Pdfium>> + Send + Sync,
{
    fn create(&self) -> Result<Box<dyn Pdfium>> {
        self()
    }
}

/// What a lease holds on to; dropping it hands the instance back
pub(crate) trait Slot {
    fn instance(&self) -> &(dyn Pdfium + 'static);
    fn instance_mut(&mut self) -> &mut (dyn Pdfium + 'static);
}

/// Exclusive use of one instance until dropped
pub struct Lease<'a> {
    slot: Box<dyn Slot + 'a>,
}

impl<'a> Lease<'a> {
    pub(crate) fn new(slot: impl Slot + 'a) -> Self {
        Self { slot: Box::new(slot) }
    }

    /// Hand the instance back; same as dropping the lease
    pub fn release(self) {}
}

impl Deref for Lease<'_> {
    type Target = dyn Pdfium;

    fn deref(&self) -> &Self::Target {
        self.slot.instance()
    }
}

impl DerefMut for Lease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.slot.instance_mut()
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let instance = self.slot.instance_mut();
        if !instance.is_healthy() {
            return;
        }
        match instance.close_all_documents() {
            Ok(0) => {}
            Ok(closed) => debug!(closed, "closed documents left open by lease"),
            Err(e) => warn!(error = %e, "failed to close documents on release"),
        }
    }
}

/// Build the pool selected by configuration
pub fn from_config(config: &Config) -> Result<Arc<dyn Pool>> {
    match config.pool.kind {
        PoolKind::Exclusive => {
            let library = Library::init(load_backend(&config.backend)?)?;
            Ok(Arc::new(ExclusivePool::new(&library, config.pool.close_timeout)?))
        }
        PoolKind::InProcess => {
            let backend = config.backend.clone();
            let factory = move || -> Result<Box<dyn Pdfium>> {
                Ok(Box::new(NativeInstance::new(load_backend(&backend)?)?))
            };
            Ok(Arc::new(MultiPool::new(factory, &config.pool)?))
        }
        PoolKind::Workers => {
            let worker = config.worker.clone();
            let factory = move || -> Result<Box<dyn Pdfium>> {
                Ok(Box::new(WorkerInstance::spawn(&worker)?))
            };
            Ok(Arc::new(MultiPool::new(factory, &config.pool)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::native::simulated::SampleDocument;
    use crate::types::OpenDocument;

    #[test]
    fn test_in_process_pool_from_config() {
        let config = Config {
            pool: PoolConfig {
                kind: PoolKind::InProcess,
                size: 2,
                ..PoolConfig::default()
            },
            ..Config::default()
        };
        let pool = from_config(&config).unwrap();
        assert_eq!(pool.stats().max_size, 2);
        assert_eq!(pool.stats().available, 2);

        let mut lease = pool.get_instance(Duration::from_millis(100)).unwrap();
        let document = lease
            .open_document(OpenDocument::from_bytes(SampleDocument::a4_pages(3).to_bytes()))
            .unwrap();
        assert_eq!(lease.get_page_count(&document).unwrap(), 3);
        drop(lease);
        pool.close().unwrap();
    }

    #[test]
    fn test_exclusive_pool_from_config() {
        let pool = from_config(&Config::default()).unwrap();
        assert_eq!(pool.stats().max_size, 1);
        pool.close().unwrap();
    }
}
