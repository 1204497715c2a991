use std::convert::Infallible;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
};
use futures::StreamExt;
use serde::Deserialize;
use tokio::time::Instant;

use super::AppState;
use crate::models::ProgressEvent;
use crate::services::channel::ProgressChannel;
use crate::services::progress;

#[derive(Debug, Default, Deserialize)]
pub struct ProgressQuery {
    /// `false` selects the one-shot JSON poll.
    #[serde(default)]
    pub stream: Option<String>,
}

impl ProgressQuery {
    fn wants_stream(&self) -> bool {
        self.stream.as_deref() != Some("false")
    }
}

/// `GET /api/generation-progress/:book_id[?stream=false]`
pub async fn generation_progress(
    State(state): State<AppState>,
    Path(book_id): Path<String>,
    Query(query): Query<ProgressQuery>,
) -> Response {
    if query.wants_stream() {
        stream_progress(state, book_id).into_response()
    } else {
        poll_progress(state, book_id)
    }
}

fn stream_progress(
    state: AppState,
    book_id: String,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let events = ProgressChannel::new(state.registry.clone(), &book_id, state.channel.clone()).open();
    Sse::new(events.map(|event| Ok(to_sse(&event))))
}

fn to_sse(event: &ProgressEvent) -> Event {
    match serde_json::to_string(event) {
        Ok(data) => Event::default().data(data),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode progress event");
            Event::default().data(r#"{"error":"encoding failed"}"#)
        }
    }
}

fn poll_progress(state: AppState, book_id: String) -> Response {
    tracing::debug!(book_id = %book_id, "progress poll");
    let now = Instant::now();
    match state
        .registry
        .lookup(&book_id, |job| progress::snapshot(job, now, true))
        .found()
    {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "No book generation found for this id" })),
        )
            .into_response(),
    }
}
