//! Out-of-process instances
//!
//! A worker is a `pdfium-worker` child process running one
//! [`NativeInstance`](crate::instance::NativeInstance). The host reaches it
//! through [`WorkerInstance`], which implements the same
//! [`Pdfium`](crate::instance::Pdfium) trait, so pools treat in-process and
//! out-of-process instances alike.
//!
//! ```text
//! host                                   worker (stdin/stdout)
//!  │ ── Hello {version, key, value} ──▶  │
//!  │ ◀── Accepted | Rejected ──────────  │
//!  │ ── Envelope {id, Request} ───────▶  │  dispatch on its instance
//!  │ ◀── Envelope {id, Ok | Err} ──────  │
//!  │ ── Envelope {id, Shutdown} ──────▶  │  reply, destroy library, exit
//! ```

mod client;
mod process;
pub mod protocol;
mod server;
pub mod transport;

pub use client::WorkerInstance;
pub use process::WorkerProcess;
pub use protocol::{Envelope, Handshake, Reply, Request, Response};
pub use server::{dispatch, serve};
