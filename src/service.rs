//! Async facade over a pool
//!
//! PDFium calls block, so every operation runs on tokio's blocking pool.
//! The whole operation, lease wait included, is bounded by a deadline.
//! A call that overruns it keeps running on its blocking thread until it
//! finishes; only the caller stops waiting.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{PdfiumError, Result};
use crate::instance::Pdfium;
use crate::pool::{self, Pool, PoolStats};
use crate::types::{OpenDocument, Page, RenderPageInDpi, RenderedPage};

#[derive(Clone)]
pub struct PdfService {
    pool: Arc<dyn Pool>,
    acquire_timeout: Duration,
    deadline: Duration,
}

impl PdfService {
    pub fn new(pool: Arc<dyn Pool>, acquire_timeout: Duration) -> Self {
        Self {
            pool,
            acquire_timeout,
            deadline: acquire_timeout.saturating_mul(2),
        }
    }

    /// Build the configured pool and wrap it
    pub fn from_config(config: &Config) -> Result<Self> {
        let pool = pool::from_config(config)?;
        Ok(Self::new(pool, config.pool.acquire_timeout)
            .with_deadline(config.pool.acquire_timeout.saturating_add(config.worker.call_timeout)))
    }

    /// Bound on lease wait plus execution
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn pool(&self) -> &Arc<dyn Pool> {
        &self.pool
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Lease an instance on the blocking pool and run `f` on it
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Pdfium) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        let acquire_timeout = self.acquire_timeout;
        let task = tokio::task::spawn_blocking(move || {
            let mut lease = pool.get_instance(acquire_timeout)?;
            f(&mut *lease)
        });

        match tokio::time::timeout(self.deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(error = %e, "blocking PDFium task failed");
                Err(PdfiumError::Io(format!("blocking task failed: {e}")))
            }
            Err(_) => {
                debug!(deadline = ?self.deadline, "operation missed its deadline");
                Err(PdfiumError::Timeout(self.deadline))
            }
        }
    }

    /// Open, count and close in one lease
    pub async fn page_count(&self, bytes: Vec<u8>) -> Result<usize> {
        self.run(move |pdfium| {
            let document = pdfium.open_document(OpenDocument::from_bytes(bytes))?;
            let count = pdfium.get_page_count(&document);
            pdfium.close_document(&document)?;
            count
        })
        .await
    }

    /// Render one page of `bytes` at `dpi`
    pub async fn render_page(&self, bytes: Vec<u8>, index: usize, dpi: u32) -> Result<RenderedPage> {
        self.run(move |pdfium| {
            let document = pdfium.open_document(OpenDocument::from_bytes(bytes))?;
            let rendered = pdfium.render_page_in_dpi(&RenderPageInDpi {
                page: Page::index(document, index),
                dpi: Some(dpi),
            });
            pdfium.close_document(&document)?;
            rendered
        })
        .await
    }

    /// Close the pool on the blocking pool
    pub async fn close(&self) -> Result<()> {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || pool.close())
            .await
            .map_err(|e| PdfiumError::Io(format!("blocking task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::simulated::SampleDocument;
    use crate::native::{Library, SimulatedModule};
    use crate::pool::ExclusivePool;

    fn exclusive() -> Arc<dyn Pool> {
        let library = Library::init(Box::new(SimulatedModule::new())).unwrap();
        Arc::new(ExclusivePool::new(&library, Duration::from_secs(1)).unwrap())
    }

    #[tokio::test]
    async fn test_page_count() {
        let service = PdfService::new(exclusive(), Duration::from_secs(1));
        let count = service.page_count(SampleDocument::a4_pages(4).to_bytes()).await.unwrap();
        assert_eq!(count, 4);
        assert_eq!(service.stats().active, 0);
    }

    #[tokio::test]
    async fn test_render_page() {
        let service = PdfService::new(exclusive(), Duration::from_secs(1));
        let rendered = service
            .render_page(SampleDocument::a4_pages(1).to_bytes(), 0, 150)
            .await
            .unwrap();
        assert_eq!((rendered.width, rendered.height), (1241, 1754));
        assert!((rendered.points_to_pixel_ratio - 150.0 / 72.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_out_of_range_page_is_reported() {
        let service = PdfService::new(exclusive(), Duration::from_secs(1));
        let err = service
            .render_page(SampleDocument::a4_pages(1).to_bytes(), 3, 72)
            .await
            .unwrap_err();
        assert_eq!(err, PdfiumError::Page { index: 3, count: 1 });
    }

    #[tokio::test]
    async fn test_busy_pool_times_out() {
        let pool = exclusive();
        let service = PdfService::new(Arc::clone(&pool), Duration::from_millis(50));
        let _held = pool.get_instance(Duration::from_millis(50)).unwrap();

        let err = service.page_count(SampleDocument::a4_pages(1).to_bytes()).await.unwrap_err();
        assert_eq!(err, PdfiumError::Timeout(Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_deadline_bounds_the_operation() {
        let service = PdfService::new(exclusive(), Duration::from_secs(1)).with_deadline(Duration::from_millis(20));
        let err = service
            .run(|_| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err, PdfiumError::Timeout(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_unbounded_acquire_timeout() {
        let service = PdfService::new(exclusive(), Duration::MAX);
        let count = service.page_count(SampleDocument::a4_pages(2).to_bytes()).await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_close_rejects_later_work() {
        let service = PdfService::new(exclusive(), Duration::from_secs(1));
        service.close().await.unwrap();
        let err = service.page_count(SampleDocument::a4_pages(1).to_bytes()).await.unwrap_err();
        assert_eq!(err, PdfiumError::PoolClosed);
    }
}
