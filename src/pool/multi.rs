//! Bounded pool of independent instances
//!
//! Each slot owns one instance (an in-process [`NativeInstance`] on its own
//! module, or a worker process). Idle slots sit in a stack guarded by a
//! mutex; callers without one wait on a condvar until a slot comes back or
//! their timeout expires.
//!
//! [`NativeInstance`]: crate::instance::NativeInstance

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{ArcMutexGuard, Condvar, Mutex, RawMutex};
use tracing::{debug, info, warn};

use super::{InstanceFactory, Lease, Pool, PoolStats, Slot};
use crate::config::PoolConfig;
use crate::error::{PdfiumError, Result};
use crate::instance::Pdfium;

type Cell = Arc<Mutex<Box<dyn Pdfium>>>;

struct State {
    idle: Vec<Cell>,
    leased: usize,
    closed: bool,
}

pub struct MultiPool {
    factory: Box<dyn InstanceFactory>,
    state: Mutex<State>,
    /// Signalled when a slot becomes idle or the pool closes
    available: Condvar,
    /// Signalled when a lease comes back
    returned: Condvar,
    max_size: usize,
    close_timeout: Duration,
    replace_crashed: bool,
    created: AtomicUsize,
    evicted: AtomicUsize,
}

impl MultiPool {
    /// Create `config.size` instances up front
    pub fn new(factory: impl InstanceFactory + 'static, config: &PoolConfig) -> Result<Self> {
        let max_size = config.size.max(1);
        let mut idle: Vec<Cell> = Vec::with_capacity(max_size);
        for _ in 0..max_size {
            match factory.create() {
                Ok(instance) => idle.push(Arc::new(Mutex::new(instance))),
                Err(e) => {
                    warn!(error = %e, created = idle.len(), "pool creation failed, shutting down created instances");
                    shutdown_all(idle);
                    return Err(e);
                }
            }
        }
        info!(size = max_size, "instance pool created");

        Ok(Self {
            factory: Box::new(factory),
            state: Mutex::new(State {
                idle,
                leased: 0,
                closed: false,
            }),
            available: Condvar::new(),
            returned: Condvar::new(),
            max_size,
            close_timeout: config.close_timeout,
            replace_crashed: config.replace_crashed,
            created: AtomicUsize::new(max_size),
            evicted: AtomicUsize::new(0),
        })
    }

    /// Called by a slot coming back from a lease
    fn give_back(&self, cell: Cell, guard: &mut Box<dyn Pdfium>) {
        let healthy = guard.is_healthy();
        let mut state = self.state.lock();
        state.leased -= 1;
        self.returned.notify_all();

        if state.closed {
            drop(state);
            debug!("lease returned after close, shutting instance down");
            if let Err(e) = guard.shutdown() {
                warn!(error = %e, "failed to shut down returned instance");
            }
            return;
        }

        if healthy {
            state.idle.push(cell);
            self.available.notify_one();
            return;
        }

        drop(state);
        let evicted = self.evicted.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(evicted, "evicting unhealthy instance");
        if let Err(e) = guard.shutdown() {
            debug!(error = %e, "shutdown of evicted instance failed");
        }
        if self.replace_crashed {
            self.replace();
        }
    }

    fn replace(&self) {
        let instance = match self.factory.create() {
            Ok(instance) => instance,
            Err(e) => {
                warn!(error = %e, "failed to create replacement instance");
                return;
            }
        };
        self.created.fetch_add(1, Ordering::Relaxed);

        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            shutdown_all(vec![Arc::new(Mutex::new(instance))]);
            return;
        }
        state.idle.push(Arc::new(Mutex::new(instance)));
        self.available.notify_one();
        info!("replacement instance added");
    }
}

fn shutdown_all(cells: Vec<Cell>) -> Option<PdfiumError> {
    let mut first = None;
    for cell in cells {
        if let Err(e) = cell.lock().shutdown() {
            warn!(error = %e, "instance shutdown failed");
            first.get_or_insert(e);
        }
    }
    first
}

impl Pool for MultiPool {
    fn get_instance(&self, timeout: Duration) -> Result<Lease<'_>> {
        // `None` waits without a bound
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PdfiumError::PoolClosed);
            }
            if let Some(cell) = state.idle.pop() {
                state.leased += 1;
                drop(state);
                // the previous holder may still be dropping its guard
                let guard = cell.lock_arc();
                return Ok(Lease::new(MultiSlot { guard, pool: self }));
            }
            let Some(deadline) = deadline else {
                self.available.wait(&mut state);
                continue;
            };
            if self.available.wait_until(&mut state, deadline).timed_out() && state.idle.is_empty() {
                if state.closed {
                    return Err(PdfiumError::PoolClosed);
                }
                debug!(?timeout, leased = state.leased, "timed out waiting for an instance");
                return Err(PdfiumError::Timeout(timeout));
            }
        }
    }

    fn close(&self) -> Result<()> {
        let idle = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        self.available.notify_all();

        let failure = shutdown_all(idle);

        let deadline = Instant::now().checked_add(self.close_timeout);
        let mut state = self.state.lock();
        while state.leased > 0 {
            let Some(deadline) = deadline else {
                self.returned.wait(&mut state);
                continue;
            };
            if self.returned.wait_until(&mut state, deadline).timed_out() {
                if state.leased > 0 {
                    warn!(
                        outstanding = state.leased,
                        "leases still out after close timeout, they are shut down on return"
                    );
                }
                break;
            }
        }
        info!(evicted = self.evicted.load(Ordering::Relaxed), "instance pool closed");

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            created: self.created.load(Ordering::Relaxed),
            active: state.leased,
            available: state.idle.len(),
            max_size: self.max_size,
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

impl Drop for MultiPool {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "failed to close instance pool");
        }
    }
}

struct MultiSlot<'a> {
    guard: ArcMutexGuard<RawMutex, Box<dyn Pdfium>>,
    pool: &'a MultiPool,
}

impl Slot for MultiSlot<'_> {
    fn instance(&self) -> &(dyn Pdfium + 'static) {
        &**self.guard
    }

    fn instance_mut(&mut self) -> &mut (dyn Pdfium + 'static) {
        &mut **self.guard
    }
}

impl Drop for MultiSlot<'_> {
    fn drop(&mut self) {
        let cell = Arc::clone(ArcMutexGuard::mutex(&self.guard));
        self.pool.give_back(cell, &mut self.guard);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;

    use super::*;
    use crate::instance::NativeInstance;
    use crate::native::simulated::SampleDocument;
    use crate::native::SimulatedModule;
    use crate::types::OpenDocument;

    fn native() -> Result<Box<dyn Pdfium>> {
        Ok(Box::new(NativeInstance::new(Box::new(SimulatedModule::new()))?))
    }

    fn config(size: usize) -> PoolConfig {
        PoolConfig {
            size,
            close_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        }
    }

    #[test]
    fn test_exhausted_pool_times_out() {
        let pool = MultiPool::new(native, &config(2)).unwrap();
        let _first = pool.get_instance(Duration::from_millis(50)).unwrap();
        let _second = pool.get_instance(Duration::from_millis(50)).unwrap();
        assert_eq!(pool.stats().active, 2);
        assert_eq!(pool.stats().available, 0);

        let started = Instant::now();
        let result = pool.get_instance(Duration::from_millis(50)).map(|_| ());
        assert_eq!(result, Err(PdfiumError::Timeout(Duration::from_millis(50))));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_waiter_is_woken_by_release() {
        let pool = MultiPool::new(native, &config(1)).unwrap();
        let held = pool.get_instance(Duration::from_millis(50)).unwrap();

        thread::scope(|scope| {
            let waiter = scope.spawn(|| pool.get_instance(Duration::from_secs(5)).is_ok());
            thread::sleep(Duration::from_millis(20));
            drop(held);
            assert!(waiter.join().unwrap());
        });
        assert_eq!(pool.stats().available, 1);
    }

    #[test]
    fn test_unbounded_timeout_waits_for_release() {
        let pool = MultiPool::new(native, &config(1)).unwrap();
        let held = pool.get_instance(Duration::MAX).unwrap();

        thread::scope(|scope| {
            let waiter = scope.spawn(|| pool.get_instance(Duration::MAX).is_ok());
            thread::sleep(Duration::from_millis(20));
            drop(held);
            assert!(waiter.join().unwrap());
        });
        assert_eq!(pool.stats().active, 0);
    }

    #[test]
    fn test_unbounded_close_timeout_waits_for_leases() {
        let config = PoolConfig {
            close_timeout: Duration::MAX,
            ..config(1)
        };
        let pool = MultiPool::new(native, &config).unwrap();
        let held = pool.get_instance(Duration::from_millis(50)).unwrap();

        thread::scope(|scope| {
            let closer = scope.spawn(|| pool.close());
            thread::sleep(Duration::from_millis(30));
            assert!(!closer.is_finished());
            drop(held);
            assert_eq!(closer.join().unwrap(), Ok(()));
        });
        assert_eq!(pool.stats().active, 0);
    }

    #[test]
    fn test_instance_never_leased_twice() {
        let pool = MultiPool::new(native, &config(3)).unwrap();
        let held: Mutex<HashSet<usize>> = Mutex::new(HashSet::new());
        let bytes = SampleDocument::a4_pages(1).to_bytes();

        thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..10 {
                        let mut lease = pool.get_instance(Duration::from_secs(10)).unwrap();
                        let address = &*lease as *const dyn Pdfium as *const () as usize;
                        assert!(held.lock().insert(address), "instance leased twice");
                        let document = lease.open_document(OpenDocument::from_bytes(bytes.clone())).unwrap();
                        assert_eq!(lease.get_page_count(&document).unwrap(), 1);
                        held.lock().remove(&address);
                    }
                });
            }
        });
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().available, 3);
        assert_eq!(pool.stats().created, 3);
    }

    #[test]
    fn test_unhealthy_instance_is_replaced() {
        let pool = MultiPool::new(native, &config(2)).unwrap();
        {
            let mut lease = pool.get_instance(Duration::from_millis(50)).unwrap();
            lease.shutdown().unwrap();
            assert!(!lease.is_healthy());
        }
        let stats = pool.stats();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.created, 3);
        assert_eq!(stats.available, 2);

        let lease = pool.get_instance(Duration::from_millis(50)).unwrap();
        assert!(lease.is_healthy());
    }

    #[test]
    fn test_unhealthy_instance_without_replacement_shrinks_pool() {
        let config = PoolConfig {
            replace_crashed: false,
            ..config(1)
        };
        let pool = MultiPool::new(native, &config).unwrap();
        pool.get_instance(Duration::from_millis(50)).unwrap().shutdown().unwrap();
        assert_eq!(pool.stats().available, 0);
        assert!(matches!(
            pool.get_instance(Duration::from_millis(20)),
            Err(PdfiumError::Timeout(_))
        ));
    }

    #[test]
    fn test_close_wakes_waiters() {
        let pool = MultiPool::new(native, &config(1)).unwrap();
        let held = pool.get_instance(Duration::from_millis(50)).unwrap();

        thread::scope(|scope| {
            let waiter = scope.spawn(|| pool.get_instance(Duration::from_secs(5)).map(|_| ()));
            thread::sleep(Duration::from_millis(20));
            let started = Instant::now();
            pool.close().unwrap();
            assert!(started.elapsed() >= Duration::from_millis(50));
            assert_eq!(waiter.join().unwrap(), Err(PdfiumError::PoolClosed));
        });

        // the orphaned lease is shut down when it comes back
        drop(held);
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().available, 0);
        assert_eq!(
            pool.get_instance(Duration::from_millis(10)).map(|_| ()),
            Err(PdfiumError::PoolClosed)
        );
    }

    #[test]
    fn test_failing_factory_fails_creation() {
        let attempts = AtomicUsize::new(0);
        let factory = move || -> Result<Box<dyn Pdfium>> {
            if attempts.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(PdfiumError::Handshake("refused".into()));
            }
            native()
        };
        let err = MultiPool::new(factory, &config(3)).map(|_| ()).unwrap_err();
        assert_eq!(err, PdfiumError::Handshake("refused".into()));
    }
}
