//! pdfium-worker
//!
//! Out-of-process PDFium instance. The host spawns this binary, performs the
//! handshake over stdin/stdout and then sends framed requests. Logs go to
//! stderr because stdout carries the channel.

use std::io;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pdfium_pool::config::Config;
use pdfium_pool::instance::NativeInstance;
use pdfium_pool::native::load_backend;
use pdfium_pool::worker::protocol::{MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE};
use pdfium_pool::worker::serve;

fn main() -> Result<()> {
    // Load configuration
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pdfium_pool=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    if std::env::var(MAGIC_COOKIE_KEY).as_deref() != Ok(MAGIC_COOKIE_VALUE) {
        eprintln!(
            "This binary is a pdfium-pool worker and is not meant to be run directly.\n\
             It is started by the pdfium-pool host, which talks to it over stdin/stdout."
        );
        std::process::exit(1);
    }

    let config = Config::from_env();
    tracing::info!(
        "Starting pdfium-worker v{} (pid {}, {:?} backend)",
        env!("CARGO_PKG_VERSION"),
        std::process::id(),
        config.backend.backend
    );

    let module = load_backend(&config.backend).context("failed to load the PDFium backend")?;
    let mut instance = NativeInstance::new(module).context("failed to initialise PDFium")?;

    serve(&mut instance, io::stdin().lock(), io::stdout().lock()).context("worker channel failed")?;
    Ok(())
}
