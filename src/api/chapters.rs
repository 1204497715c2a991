use axum::{
    Json,
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::AppState;
use crate::error::ApiError;
use crate::models::{ChapterSpec, GenerateChapterRequest, Outline, OutlineRequest};
use crate::services::prompts;

fn validate_chapter(request: GenerateChapterRequest) -> Result<(String, ChapterSpec), ApiError> {
    if request.book_title.trim().is_empty() {
        return Err(ApiError::Validation("bookTitle is required".to_string()));
    }
    match request.chapter {
        Some(chapter) if !chapter.title.trim().is_empty() => Ok((request.book_title, chapter)),
        Some(_) => Err(ApiError::Validation("chapter title is required".to_string())),
        None => Err(ApiError::Validation("chapter is required".to_string())),
    }
}

/// `POST /api/generate-chapter`
///
/// Streams one chapter as plain text. Nothing is registered; the body simply
/// carries the fragments in the order the backend produces them.
pub async fn generate_chapter(
    State(state): State<AppState>,
    Json(request): Json<GenerateChapterRequest>,
) -> Result<Response, ApiError> {
    let (book_title, chapter) = validate_chapter(request)?;
    let number = chapter.number.unwrap_or(1);
    tracing::info!(
        chapter = number,
        title = %chapter.title,
        provider = state.generator.provider_name(),
        "API request: POST /api/generate-chapter"
    );

    // Only an explicit first chapter with an insight to build towards is a hook.
    let hook = chapter.number == Some(1) && chapter.aha_moment().is_some();
    let prompt = prompts::chapter_prompt(&book_title, number, &chapter, hook);
    let (tx, rx) = mpsc::unbounded_channel::<Result<String, std::io::Error>>();
    let generator = state.generator.clone();

    tokio::spawn(async move {
        let fragments = tx.clone();
        let sink = move |fragment: &str| {
            // A closed receiver means the client left; the run still finishes.
            let _ = fragments.send(Ok(fragment.to_string()));
        };
        match generator.generate(prompt.into_request(), Some(&sink)).await {
            Ok(text) => {
                tracing::info!(chapter = number, chars = text.chars().count(), "chapter streamed");
            }
            Err(e) => {
                tracing::error!(chapter = number, error = %e, "chapter stream failed");
                let _ = tx.send(Err(std::io::Error::other(e.to_string())));
            }
        }
    });

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(UnboundedReceiverStream::new(rx)),
    )
        .into_response())
}

/// `POST /api/generate-outline`
pub async fn generate_outline(
    State(state): State<AppState>,
    Json(request): Json<OutlineRequest>,
) -> Result<Json<Outline>, ApiError> {
    let topic = request.topic.trim();
    let description = request.description.trim();
    if topic.is_empty() || description.is_empty() {
        return Err(ApiError::Validation(
            "topic and description are required".to_string(),
        ));
    }
    tracing::info!(topic = %topic, "API request: POST /api/generate-outline");

    if state.offline {
        tracing::warn!("no language model configured, returning sample outline");
        return Ok(Json(prompts::sample_outline(topic)));
    }

    let reply = state
        .generator
        .generate(prompts::outline_prompt(topic, description), None)
        .await?;
    let outline = prompts::parse_outline(topic, &reply);
    if outline.chapters.is_empty() {
        tracing::warn!(topic = %topic, "outline reply could not be parsed");
    }
    Ok(Json(outline))
}
