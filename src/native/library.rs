//! Reference-counted library lifecycle
//!
//! PDFium keeps process-wide state between `FPDF_InitLibrary` and
//! `FPDF_DestroyLibrary`. A [`Library`] owns that window for one module:
//! every pool built on it holds a [`LibraryHandle`], and releasing the last
//! handle closes all open documents and destroys the library. After that,
//! `acquire` fails with [`PdfiumError::LibraryClosed`].

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::NativeModule;
use crate::error::{PdfiumError, Result};
use crate::instance::{NativeInstance, Pdfium};

/// How long the last release waits for an outstanding lease before deferring
/// teardown to that lease
const TEARDOWN_WAIT: Duration = Duration::from_secs(5);

struct Shared {
    instance: Arc<Mutex<NativeInstance>>,
    refs: Mutex<RefState>,
}

#[derive(Debug, Default)]
struct RefState {
    count: usize,
    closed: bool,
}

/// An initialised native library, shared by the pools that use it
#[derive(Clone)]
pub struct Library {
    shared: Arc<Shared>,
}

impl Library {
    /// Initialise the library on `module`
    pub fn init(module: Box<dyn NativeModule>) -> Result<Self> {
        let instance = NativeInstance::new(module)?;
        Ok(Self {
            shared: Arc::new(Shared {
                instance: Arc::new(Mutex::new(instance)),
                refs: Mutex::new(RefState::default()),
            }),
        })
    }

    /// Take a counted reference
    pub fn acquire(&self) -> Result<LibraryHandle> {
        let mut refs = self.shared.refs.lock();
        if refs.closed {
            return Err(PdfiumError::LibraryClosed);
        }
        refs.count += 1;
        debug!(refs = refs.count, "library reference acquired");
        Ok(LibraryHandle {
            library: self.clone(),
            released: false,
        })
    }

    pub fn ref_count(&self) -> usize {
        self.shared.refs.lock().count
    }

    /// True once the last reference was released
    pub fn is_closed(&self) -> bool {
        self.shared.refs.lock().closed
    }

    fn release(&self) -> Result<()> {
        {
            let mut refs = self.shared.refs.lock();
            refs.count = refs.count.saturating_sub(1);
            debug!(refs = refs.count, "library reference released");
            if refs.count > 0 || refs.closed {
                return Ok(());
            }
            refs.closed = true;
        }

        match self.shared.instance.try_lock_for(TEARDOWN_WAIT) {
            Some(mut instance) => {
                instance.shutdown()?;
                info!("last library reference released, library torn down");
            }
            None => {
                warn!("instance still leased, teardown deferred to its release");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Library {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let refs = self.shared.refs.lock();
        f.debug_struct("Library")
            .field("refs", &refs.count)
            .field("closed", &refs.closed)
            .finish()
    }
}

/// One counted reference to a [`Library`]; released explicitly or on drop
pub struct LibraryHandle {
    library: Library,
    released: bool,
}

impl LibraryHandle {
    /// The library's instance, locked by whoever uses it
    pub fn instance(&self) -> &Arc<Mutex<NativeInstance>> {
        &self.library.shared.instance
    }

    pub fn library(&self) -> &Library {
        &self.library
    }

    /// Drop the reference, tearing the library down if it was the last one
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.library.release()
    }
}

impl Drop for LibraryHandle {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.library.release() {
                warn!(error = %e, "library release failed");
            }
        }
    }
}
