//! Derives progress snapshots from a job. Pure: reads a `BookJob`, never
//! mutates it.

use tokio::time::Instant;

use crate::models::{BookJob, ChapterProgress, ChapterStatus, ProgressSnapshot};

/// Characters of chapter content included in a poll preview.
pub const PREVIEW_CHARS: usize = 100;

pub fn snapshot(job: &BookJob, now: Instant, with_preview: bool) -> ProgressSnapshot {
    let elapsed = now.saturating_duration_since(job.started_at).as_secs_f64();
    let completion_rate = if job.total_chapters == 0 {
        0.0
    } else {
        job.completed_chapters as f64 / job.total_chapters as f64
    };
    let estimated_total = if completion_rate > 0.0 {
        elapsed / completion_rate
    } else {
        0.0
    };
    let estimated_remaining = (estimated_total - elapsed).max(0.0);

    let chapters = job
        .chapters
        .iter()
        .map(|chapter| ChapterProgress {
            index: chapter.index,
            title: chapter.title.clone(),
            status: chapter.status,
            content_length: chapter.content.chars().count(),
            preview: with_preview.then(|| preview(&chapter.content)),
        })
        .collect();

    ProgressSnapshot {
        book_id: job.id.clone(),
        total_chapters: job.total_chapters,
        completed_chapters: job.completed_chapters,
        progress: (completion_rate * 100.0).round() as u32,
        elapsed_time: elapsed.round() as u64,
        estimated_remaining_time: estimated_remaining.round() as u64,
        chapters,
        is_complete: job.is_settled(),
    }
}

/// First [`PREVIEW_CHARS`] characters, with `...` when cut.
pub fn preview(content: &str) -> String {
    let mut chars = content.char_indices();
    match chars.nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &content[..cut]),
        None => content.to_string(),
    }
}

/// Count of chapters that ended in `error`.
pub fn failed_chapters(job: &BookJob) -> usize {
    job.count_with(ChapterStatus::Error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChapterSpec;
    use std::time::Duration;

    fn job(n: usize) -> BookJob {
        let specs = (0..n)
            .map(|i| ChapterSpec {
                title: format!("Chapter {}", i + 1),
                ..Default::default()
            })
            .collect();
        BookJob::new("b1", "Book", specs)
    }

    fn finish(job: &mut BookJob, index: usize, status: ChapterStatus) {
        job.chapters[index].status = status;
        if status == ChapterStatus::Completed {
            job.completed_chapters += 1;
        }
    }

    #[tokio::test]
    async fn fresh_job_reports_zero_progress() {
        let job = job(3);
        let snap = snapshot(&job, job.started_at + Duration::from_secs(7), false);
        assert_eq!(snap.progress, 0);
        assert_eq!(snap.elapsed_time, 7);
        assert_eq!(snap.estimated_remaining_time, 0);
        assert!(!snap.is_complete);
        assert!(snap.chapters.iter().all(|c| c.preview.is_none()));
    }

    #[tokio::test]
    async fn estimates_remaining_from_completion_rate() {
        let mut job = job(4);
        finish(&mut job, 0, ChapterStatus::Completed);

        let snap = snapshot(&job, job.started_at + Duration::from_secs(30), false);
        assert_eq!(snap.progress, 25);
        assert_eq!(snap.elapsed_time, 30);
        assert_eq!(snap.estimated_remaining_time, 90);
    }

    #[tokio::test]
    async fn progress_rounds_to_nearest_percent() {
        let mut job = job(3);
        finish(&mut job, 0, ChapterStatus::Completed);
        finish(&mut job, 1, ChapterStatus::Completed);
        let snap = snapshot(&job, job.started_at, false);
        assert_eq!(snap.progress, 67);
        assert_eq!(snap.estimated_remaining_time, 0);
    }

    #[tokio::test]
    async fn error_chapters_settle_the_job_without_counting_as_completed() {
        let mut job = job(2);
        finish(&mut job, 0, ChapterStatus::Completed);
        finish(&mut job, 1, ChapterStatus::Error);

        let snap = snapshot(&job, job.started_at + Duration::from_secs(10), false);
        assert!(snap.is_complete);
        assert_eq!(snap.completed_chapters, 1);
        assert_eq!(snap.progress, 50);
        assert_eq!(failed_chapters(&job), 1);
    }

    #[tokio::test]
    async fn empty_job_is_degenerate_not_complete() {
        let job = job(0);
        let snap = snapshot(&job, job.started_at, false);
        assert_eq!(snap.progress, 0);
        assert!(!snap.is_complete);
    }

    #[tokio::test]
    async fn poll_view_carries_length_and_preview() {
        let mut job = job(2);
        job.chapters[0].content = "é".repeat(150);
        job.chapters[1].content = "short".into();

        let snap = snapshot(&job, job.started_at, true);
        assert_eq!(snap.chapters[0].content_length, 150);
        let preview = snap.chapters[0].preview.as_deref().unwrap();
        assert_eq!(preview.chars().count(), 103);
        assert!(preview.ends_with("..."));
        assert_eq!(snap.chapters[1].preview.as_deref(), Some("short"));
    }

    #[test]
    fn preview_keeps_exactly_one_hundred_chars() {
        assert_eq!(preview(&"a".repeat(100)), "a".repeat(100));
        assert_eq!(preview(&"a".repeat(101)), format!("{}...", "a".repeat(100)));
    }
}
