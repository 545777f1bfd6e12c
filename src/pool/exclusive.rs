//! Single-instance pool
//!
//! Every operation goes through one [`NativeInstance`] behind the library
//! lock. Several pools may share one [`Library`]; the library is torn down
//! when the last of them closes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use tracing::{debug, info, warn};

use super::{Lease, Pool, PoolStats, Slot};
use crate::error::{PdfiumError, Result};
use crate::instance::{NativeInstance, Pdfium};
use crate::native::{Library, LibraryHandle};

pub struct ExclusivePool {
    library: Library,
    instance: Arc<Mutex<NativeInstance>>,
    /// Taken on close
    handle: Mutex<Option<LibraryHandle>>,
    close_timeout: Duration,
    active: AtomicUsize,
}

impl ExclusivePool {
    /// Take a reference on `library` and serve its instance
    pub fn new(library: &Library, close_timeout: Duration) -> Result<Self> {
        let handle = library.acquire()?;
        let instance = Arc::clone(handle.instance());
        info!(refs = library.ref_count(), "exclusive pool created");
        Ok(Self {
            library: library.clone(),
            instance,
            handle: Mutex::new(Some(handle)),
            close_timeout,
            active: AtomicUsize::new(0),
        })
    }

    fn is_open(&self) -> bool {
        self.handle.lock().is_some()
    }
}

impl Pool for ExclusivePool {
    fn get_instance(&self, timeout: Duration) -> Result<Lease<'_>> {
        if !self.is_open() {
            return Err(PdfiumError::PoolClosed);
        }

        let guard = self.instance.try_lock_arc_for(timeout).ok_or_else(|| {
            debug!(?timeout, "timed out waiting for the library lock");
            PdfiumError::Timeout(timeout)
        })?;

        // closed while we were waiting
        if !self.is_open() {
            return Err(PdfiumError::PoolClosed);
        }
        if guard.is_destroyed() {
            return Err(PdfiumError::LibraryClosed);
        }

        self.active.fetch_add(1, Ordering::Relaxed);
        Ok(Lease::new(ExclusiveSlot { guard, pool: self }))
    }

    fn close(&self) -> Result<()> {
        let Some(handle) = self.handle.lock().take() else {
            return Ok(());
        };

        // give an outstanding lease the close timeout before the library's own wait
        if self.instance.try_lock_for(self.close_timeout).is_none() {
            warn!(timeout = ?self.close_timeout, "closing exclusive pool with a lease outstanding");
        }

        handle.release()?;
        info!(refs = self.library.ref_count(), "exclusive pool closed");
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        let active = self.active.load(Ordering::Relaxed);
        let open = usize::from(self.is_open());
        PoolStats {
            created: 1,
            active,
            available: open.saturating_sub(active),
            max_size: 1,
            evicted: 0,
        }
    }
}

impl Drop for ExclusivePool {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close exclusive pool");
        }
    }
}

struct ExclusiveSlot<'a> {
    guard: ArcMutexGuard<RawMutex, NativeInstance>,
    pool: &'a ExclusivePool,
}

impl Slot for ExclusiveSlot<'_> {
    fn instance(&self) -> &(dyn Pdfium + 'static) {
        &*self.guard
    }

    fn instance_mut(&mut self) -> &mut (dyn Pdfium + 'static) {
        &mut *self.guard
    }
}

impl Drop for ExclusiveSlot<'_> {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::Relaxed);
        // the last library reference went away while we held the lock
        if self.pool.library.is_closed() && !self.guard.is_destroyed() {
            if let Err(e) = self.guard.shutdown() {
                warn!(error = %e, "deferred library teardown failed");
            }
        }
    }
}
