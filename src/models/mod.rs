use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

/// Target length used when a chapter request does not carry one.
pub const DEFAULT_TARGET_LENGTH: u32 = 6000;

/// One chapter as requested by the client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterSpec {
    #[serde(default)]
    pub number: Option<usize>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default, alias = "estimatedWords")]
    pub target_length: Option<u32>,
    #[serde(default)]
    pub is_hook: bool,
    #[serde(default)]
    pub aha_moment: Option<String>,
}

impl ChapterSpec {
    pub fn target_length(&self) -> u32 {
        self.target_length.unwrap_or(DEFAULT_TARGET_LENGTH)
    }

    /// The insight a hook chapter is built around, if any.
    pub fn aha_moment(&self) -> Option<&str> {
        self.aha_moment
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBookRequest {
    #[serde(default)]
    pub book_id: String,
    #[serde(default)]
    pub book_title: Option<String>,
    #[serde(default)]
    pub chapters: Vec<ChapterSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChapterStatus {
    Pending,
    Generating,
    Completed,
    Error,
}

impl ChapterStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ChapterStatus::Completed | ChapterStatus::Error)
    }
}

#[derive(Debug, Clone)]
pub struct ChapterJob {
    pub index: usize,
    pub title: String,
    pub content: String,
    pub status: ChapterStatus,
    pub spec: ChapterSpec,
}

/// One generation request as held by the registry.
#[derive(Debug, Clone)]
pub struct BookJob {
    pub id: String,
    /// Distinguishes this job from an earlier job that used the same id.
    pub instance: Uuid,
    pub book_title: String,
    pub chapters: Vec<ChapterJob>,
    pub total_chapters: usize,
    pub completed_chapters: usize,
    pub started_at: Instant,
    /// A batch run is generating this job's chapters.
    pub run_active: bool,
    /// Eviction timers that fire earlier than this leave the job alone.
    pub retain_until: Instant,
}

impl BookJob {
    pub fn new(id: &str, book_title: &str, specs: Vec<ChapterSpec>) -> Self {
        let chapters: Vec<ChapterJob> = specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| ChapterJob {
                index,
                title: spec.title.clone(),
                content: String::new(),
                status: ChapterStatus::Pending,
                spec,
            })
            .collect();

        let started_at = Instant::now();
        BookJob {
            id: id.to_string(),
            instance: Uuid::new_v4(),
            book_title: book_title.to_string(),
            total_chapters: chapters.len(),
            completed_chapters: 0,
            chapters,
            started_at,
            run_active: false,
            retain_until: started_at,
        }
    }

    /// Every chapter has reached `completed` or `error`.
    pub fn is_settled(&self) -> bool {
        self.total_chapters > 0 && self.chapters.iter().all(|c| c.status.is_terminal())
    }

    pub fn count_with(&self, status: ChapterStatus) -> usize {
        self.chapters.iter().filter(|c| c.status == status).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterResult {
    pub index: usize,
    pub title: String,
    pub content: String,
    pub status: ChapterStatus,
}

/// Final response of a book generation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookResult {
    pub book_id: String,
    pub chapters: Vec<ChapterResult>,
    pub total_time_ms: u64,
    pub completed_chapters: usize,
    pub total_chapters: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterProgress {
    pub index: usize,
    pub title: String,
    pub status: ChapterStatus,
    pub content_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
}

/// Point-in-time progress record. Always complete, never a diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub book_id: String,
    pub total_chapters: usize,
    pub completed_chapters: usize,
    pub progress: u32,
    pub elapsed_time: u64,
    pub estimated_remaining_time: u64,
    pub chapters: Vec<ChapterProgress>,
    pub is_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingNotice {
    pub book_id: String,
    pub waiting: bool,
    pub message: String,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub error: String,
}

/// Payload of one push event on the progress channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressEvent {
    Waiting(WaitingNotice),
    Snapshot(ProgressSnapshot),
    Error(ErrorNotice),
}

impl ProgressEvent {
    pub fn not_found() -> Self {
        ProgressEvent::Error(ErrorNotice {
            error: "Not found".to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateChapterRequest {
    #[serde(default)]
    pub book_title: String,
    pub chapter: Option<ChapterSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutlineRequest {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineChapter {
    pub number: usize,
    pub title: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub estimated_words: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outline {
    pub title: String,
    #[serde(default)]
    pub chapters: Vec<OutlineChapter>,
}
