use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde_json::json;
use tokio::time::Instant;

use super::AppState;
use crate::error::{ApiError, RegistryError};
use crate::models::{BookResult, GenerateBookRequest};

/// Rejects malformed requests before anything touches the registry.
pub fn validate(request: &GenerateBookRequest) -> Result<(), ApiError> {
    if request.book_id.trim().is_empty() {
        return Err(ApiError::Validation("bookId is required".to_string()));
    }
    if request.chapters.is_empty() {
        return Err(ApiError::Validation(
            "at least one chapter is required".to_string(),
        ));
    }
    for (index, chapter) in request.chapters.iter().enumerate() {
        if chapter.title.trim().is_empty() {
            return Err(ApiError::Validation(format!(
                "chapter {index} is missing a title"
            )));
        }
        if chapter.target_length == Some(0) {
            return Err(ApiError::Validation(format!(
                "chapter {index} has a zero targetLength"
            )));
        }
    }
    Ok(())
}

/// `POST /api/generate-book`
///
/// Answers once every chapter has settled. The run itself is spawned, so a
/// client that hangs up does not stop generation.
pub async fn generate_book(
    State(state): State<AppState>,
    Json(request): Json<GenerateBookRequest>,
) -> Result<Json<BookResult>, ApiError> {
    let started = Instant::now();
    tracing::info!(
        book_id = %request.book_id,
        chapter_count = request.chapters.len(),
        "API request: POST /api/generate-book"
    );
    validate(&request)?;

    let book_id = request.book_id.clone();
    let book_title = request.book_title.unwrap_or_default();
    let instance = state
        .registry
        .create_job(&book_id, &book_title, request.chapters)?;
    state
        .registry
        .schedule_eviction(&book_id, instance, state.job_retention);

    let scheduler = state.scheduler.clone();
    let id = book_id.clone();
    let result = tokio::spawn(async move { scheduler.run(&id).await })
        .await
        .map_err(|e| ApiError::Internal(format!("generation task failed: {e}")))??;

    tracing::info!(
        book_id = %book_id,
        status = 200,
        duration_ms = started.elapsed().as_millis() as u64,
        "API response: POST /api/generate-book"
    );
    Ok(Json(result))
}

/// `POST /api/generation-progress/:book_id/chapters/:index/retry`
///
/// Resets a failed chapter and regenerates it in the background. Refused
/// with `409` while the book's batch run is still going. The job's retention
/// restarts so the result is not evicted mid-generation.
pub async fn retry_chapter(
    State(state): State<AppState>,
    Path((book_id, index)): Path<(String, usize)>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let retry = state.scheduler.prepare_retry(&book_id, index)?;
    state.registry.extend_retention(&book_id, state.job_retention);
    tracing::info!(book_id = %book_id, chapter = index + 1, "retrying chapter");

    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        scheduler.run_retry(retry).await;
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "bookId": book_id, "index": index, "status": "pending" })),
    ))
}

/// `DELETE /api/generation-progress/:book_id`
///
/// Drops the job ahead of its retention timer. Chapters still generating
/// finish in the background but are no longer recorded.
pub async fn discard_book(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.registry.remove(&book_id) {
        Some(job) => {
            tracing::info!(book_id = %book_id, completed = job.completed_chapters, "job discarded");
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(RegistryError::NotFound { id: book_id }.into()),
    }
}
