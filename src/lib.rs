//! pdfium-pool
//!
//! Safe concurrent access to PDFium, a single-threaded and non-reentrant
//! native library.
//!
//! # Modules
//!
//! - `memory`: arena, typed pointer views and struct codec over the native
//!   module's linear memory
//! - `native`: the native call surface, library lifecycle and backends
//! - `instance`: the `Pdfium` operation trait and the in-process instance
//! - `pool`: exclusive and multi-instance pools handing out leases
//! - `worker`: out-of-process instances behind a handshake-gated channel
//! - `service`: async facade for tokio hosts
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use pdfium_pool::{Config, OpenDocument};
//!
//! # fn main() -> pdfium_pool::Result<()> {
//! let pool = pdfium_pool::pool::from_config(&Config::from_env())?;
//! let mut lease = pool.get_instance(Duration::from_secs(5))?;
//! let document = lease.open_document(OpenDocument::from_path("report.pdf"))?;
//! println!("{} pages", lease.get_page_count(&document)?);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod instance;
pub mod memory;
pub mod native;
pub mod pool;
pub mod service;
pub mod types;
pub mod worker;

pub use config::Config;
pub use error::{ErrorKind, PdfiumError, Result};
pub use instance::{NativeInstance, Pdfium};
pub use pool::{ExclusivePool, Lease, MultiPool, Pool, PoolStats};
pub use service::PdfService;
pub use types::*;
pub use worker::WorkerInstance;
