//! HTTP surface of the service.
//!
//! - [`books`]: whole-book generation and chapter retry.
//! - [`progress`]: push (SSE) and poll progress for a book.
//! - [`chapters`]: standalone chapter streaming and outline generation.

pub mod books;
pub mod chapters;
pub mod progress;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};

use crate::services::channel::ChannelSettings;
use crate::services::llm::TextGenerationPort;
use crate::services::registry::JobRegistry;
use crate::services::scheduler::BatchScheduler;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub scheduler: BatchScheduler,
    pub generator: Arc<dyn TextGenerationPort>,
    pub channel: ChannelSettings,
    pub job_retention: Duration,
    /// No backend configured; outlines come from the built-in sample.
    pub offline: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/generate-book", post(books::generate_book))
        .route("/api/generate-chapter", post(chapters::generate_chapter))
        .route("/api/generate-outline", post(chapters::generate_outline))
        .route(
            "/api/generation-progress/:book_id",
            get(progress::generation_progress).delete(books::discard_book),
        )
        .route(
            "/api/generation-progress/:book_id/chapters/:index/retry",
            post(books::retry_chapter),
        )
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::services::llm::SampleGenerator;

    pub(crate) fn state_with(
        registry: Arc<JobRegistry>,
        generator: Arc<dyn TextGenerationPort>,
        batch_size: usize,
    ) -> AppState {
        AppState {
            scheduler: BatchScheduler::new(
                registry.clone(),
                generator.clone(),
                batch_size,
                Duration::from_secs(60),
            ),
            registry,
            generator,
            channel: ChannelSettings::default(),
            job_retention: Duration::from_secs(300),
            offline: true,
        }
    }

    pub(crate) fn sample_state() -> AppState {
        state_with(
            Arc::new(JobRegistry::new(Duration::from_secs(3600))),
            Arc::new(SampleGenerator::new(Duration::ZERO)),
            5,
        )
    }

    pub(crate) async fn body_json(response: axum::response::Response) -> serde_json::Value {
        use http_body_util::BodyExt;
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }
}
