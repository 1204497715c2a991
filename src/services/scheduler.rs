//! Drives chapter generation for one job in fixed-size batches.
//!
//! Chapters inside a batch run concurrently; the next batch starts only after
//! every chapter of the current one has completed or failed. A failed chapter
//! is marked `error` and never stops its siblings or later batches.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

use crate::error::{LlmError, RegistryError};
use crate::models::{BookResult, ChapterResult, ChapterSpec, ChapterStatus};
use crate::services::llm::{FragmentSink, TextGenerationPort};
use crate::services::prompts;
use crate::services::registry::{ChapterUpdate, JobRegistry, RunLease};

/// Splits `total` chapters into consecutive index ranges of at most
/// `batch_size`.
pub fn plan_batches(total: usize, batch_size: usize) -> Vec<Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..total)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(total))
        .collect()
}

/// Everything needed to run one chapter outside of a full book run.
#[derive(Debug, Clone)]
pub struct ChapterTask {
    pub book_id: String,
    pub book_title: String,
    pub index: usize,
    pub spec: ChapterSpec,
}

/// A failed chapter reset to `pending`. Holds the job's run lease until the
/// regeneration finishes.
#[derive(Debug)]
pub struct RetryTask {
    task: ChapterTask,
    lease: RunLease,
}

#[derive(Clone)]
pub struct BatchScheduler {
    registry: Arc<JobRegistry>,
    generator: Arc<dyn TextGenerationPort>,
    batch_size: usize,
    chapter_timeout: Duration,
}

impl BatchScheduler {
    pub fn new(
        registry: Arc<JobRegistry>,
        generator: Arc<dyn TextGenerationPort>,
        batch_size: usize,
        chapter_timeout: Duration,
    ) -> Self {
        BatchScheduler {
            registry,
            generator,
            batch_size: batch_size.max(1),
            chapter_timeout,
        }
    }

    /// Runs every chapter of the job and resolves once all of them are
    /// terminal. The result is assembled from the workers' own outcomes, so
    /// it is complete even if the job was evicted mid-run. Retries are
    /// refused until this returns.
    pub async fn run(&self, book_id: &str) -> Result<BookResult, RegistryError> {
        let started = Instant::now();
        let _lease = self.registry.begin_run(book_id)?;
        let (book_title, specs) = self
            .registry
            .lookup(book_id, |job| {
                let specs: Vec<ChapterSpec> = job.chapters.iter().map(|c| c.spec.clone()).collect();
                (job.book_title.clone(), specs)
            })
            .found()
            .ok_or_else(|| RegistryError::NotFound {
                id: book_id.to_string(),
            })?;

        let batches = plan_batches(specs.len(), self.batch_size);
        tracing::info!(
            book_id,
            total_chapters = specs.len(),
            batches = batches.len(),
            batch_size = self.batch_size,
            provider = self.generator.provider_name(),
            "starting batched generation"
        );

        let mut chapters = Vec::with_capacity(specs.len());
        for (batch_idx, batch) in batches.iter().enumerate() {
            tracing::info!(
                book_id,
                batch = batch_idx + 1,
                of = batches.len(),
                chapters_in_batch = batch.len(),
                "processing batch"
            );

            let workers = batch.clone().map(|index| {
                self.run_chapter(ChapterTask {
                    book_id: book_id.to_string(),
                    book_title: book_title.clone(),
                    index,
                    spec: specs[index].clone(),
                })
            });
            chapters.extend(join_all(workers).await);

            tracing::info!(book_id, batch = batch_idx + 1, "batch settled");
        }

        let completed_chapters = chapters
            .iter()
            .filter(|c| c.status == ChapterStatus::Completed)
            .count();
        let total_time_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            book_id,
            completed_chapters,
            failed_chapters = chapters.len() - completed_chapters,
            total_secs = total_time_ms as f64 / 1000.0,
            "book generation finished"
        );

        Ok(BookResult {
            book_id: book_id.to_string(),
            total_chapters: chapters.len(),
            completed_chapters,
            total_time_ms,
            chapters,
        })
    }

    /// Generates one chapter, streaming fragments into the registry.
    /// Never fails: backend problems end as an `error` chapter.
    pub async fn run_chapter(&self, task: ChapterTask) -> ChapterResult {
        let ChapterTask {
            book_id,
            book_title,
            index,
            spec,
        } = task;
        let number = index + 1;
        let mut result = ChapterResult {
            index,
            title: spec.title.clone(),
            content: String::new(),
            status: ChapterStatus::Error,
        };

        if let Err(e) = self.registry.mutate_chapter(&book_id, index, ChapterUpdate::Start) {
            tracing::warn!(book_id = %book_id, chapter = number, error = %e, "chapter could not start");
            return result;
        }

        let hook = index == 0 && (spec.is_hook || spec.aha_moment().is_some());
        let prompt = prompts::chapter_prompt(&book_title, number, &spec, hook);
        tracing::info!(book_id = %book_id, chapter = number, title = %spec.title, tier = ?prompt.tier, "generating chapter");

        let registry = &self.registry;
        let id = book_id.as_str();
        let sink: FragmentSink<'_> = &|fragment: &str| {
            if let Err(e) = registry.mutate_chapter(id, index, ChapterUpdate::Append(fragment.to_string())) {
                tracing::debug!(book_id = id, chapter = number, error = %e, "dropped fragment");
            }
        };

        let outcome = tokio::time::timeout(
            self.chapter_timeout,
            self.generator.generate(prompt.into_request(), Some(sink)),
        )
        .await
        .unwrap_or_else(|_| Err(LlmError::Timeout(self.chapter_timeout.as_secs())));

        match outcome {
            Ok(content) => {
                let content_length = content.chars().count();
                if let Err(e) = self
                    .registry
                    .mutate_chapter(&book_id, index, ChapterUpdate::Complete(content.clone()))
                {
                    tracing::warn!(book_id = %book_id, chapter = number, error = %e, "completed chapter not recorded");
                }
                tracing::info!(book_id = %book_id, chapter = number, content_length, "chapter completed");
                result.content = content;
                result.status = ChapterStatus::Completed;
            }
            Err(e) => {
                tracing::error!(book_id = %book_id, chapter = number, error = %e, "chapter generation failed");
                if let Err(e) = self.registry.mutate_chapter(&book_id, index, ChapterUpdate::Fail) {
                    tracing::warn!(book_id = %book_id, chapter = number, error = %e, "chapter failure not recorded");
                }
                if let Some(partial) = self
                    .registry
                    .lookup(&book_id, |job| job.chapters.get(index).map(|c| c.content.clone()))
                    .found()
                    .flatten()
                {
                    result.content = partial;
                }
            }
        }

        result
    }

    /// Resets a failed chapter to `pending` and returns the task that
    /// regenerates it. Fails with `RunInProgress` while a batch run or
    /// another retry is active on the job.
    pub fn prepare_retry(&self, book_id: &str, index: usize) -> Result<RetryTask, RegistryError> {
        let lease = self.registry.begin_run(book_id)?;
        self.registry
            .mutate_chapter(book_id, index, ChapterUpdate::Reset)?;

        let task = self
            .registry
            .lookup(book_id, |job| {
                job.chapters.get(index).map(|chapter| ChapterTask {
                    book_id: book_id.to_string(),
                    book_title: job.book_title.clone(),
                    index,
                    spec: chapter.spec.clone(),
                })
            })
            .found()
            .flatten()
            .ok_or_else(|| RegistryError::NotFound {
                id: book_id.to_string(),
            })?;
        Ok(RetryTask { task, lease })
    }

    /// Regenerates a reset chapter, then releases the job.
    pub async fn run_retry(&self, retry: RetryTask) -> ChapterResult {
        let RetryTask { task, lease } = retry;
        let result = self.run_chapter(task).await;
        drop(lease);
        result
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::services::llm::{GenerationRequest, Tier};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Scripted backend: answers every prompt with fixed fragments, fails for
    /// chapter titles listed in `failing`, and records what it saw.
    pub(crate) struct ScriptedGenerator {
        pub registry: Arc<JobRegistry>,
        pub book_id: String,
        pub failing: HashSet<String>,
        pub delay: Duration,
        pub calls: Mutex<Vec<(String, Tier)>>,
        pub barrier_violations: Mutex<Vec<String>>,
        pub batch_size: usize,
    }

    impl ScriptedGenerator {
        pub(crate) fn new(registry: Arc<JobRegistry>, book_id: &str, batch_size: usize) -> Self {
            ScriptedGenerator {
                registry,
                book_id: book_id.to_string(),
                failing: HashSet::new(),
                delay: Duration::from_millis(10),
                calls: Mutex::new(Vec::new()),
                barrier_violations: Mutex::new(Vec::new()),
                batch_size,
            }
        }

        fn title_of(prompt: &str) -> String {
            let start = prompt.find("<chapter_title>").map(|i| i + "<chapter_title>".len());
            let end = prompt.find("</chapter_title>");
            match (start, end) {
                (Some(s), Some(e)) => prompt[s..e].to_string(),
                _ => String::new(),
            }
        }
    }

    #[async_trait]
    impl TextGenerationPort for ScriptedGenerator {
        async fn generate(
            &self,
            request: GenerationRequest,
            on_fragment: Option<FragmentSink<'_>>,
        ) -> Result<String, LlmError> {
            let title = Self::title_of(&request.prompt);
            self.calls.lock().push((title.clone(), request.tier));

            // Every chapter of an earlier batch must already be terminal.
            if let Some(job) = self.registry.get_job(&self.book_id) {
                let index = job.chapters.iter().position(|c| c.title == title).unwrap();
                let batch_start = index - index % self.batch_size;
                if job.chapters[..batch_start].iter().any(|c| !c.status.is_terminal()) {
                    self.barrier_violations.lock().push(title.clone());
                }
            }

            let mut text = String::new();
            for fragment in ["Once ", "upon ", "a time."] {
                tokio::time::sleep(self.delay).await;
                if let Some(sink) = on_fragment {
                    sink(fragment);
                }
                text.push_str(fragment);
                if self.failing.contains(&title) {
                    return Err(LlmError::Stream("connection reset".into()));
                }
            }
            Ok(format!("{title}: {text}"))
        }

        fn provider_name(&self) -> &'static str {
            "scripted"
        }
    }

    pub(crate) fn specs(n: usize) -> Vec<ChapterSpec> {
        (0..n)
            .map(|i| ChapterSpec {
                title: format!("Chapter {}", i + 1),
                key_points: vec!["one".into(), "two".into()],
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn batches_cover_all_chapters_in_order() {
        let batches = plan_batches(12, 5);
        assert_eq!(batches, vec![0..5, 5..10, 10..12]);
        assert_eq!(plan_batches(5, 5), vec![0..5]);
        assert!(plan_batches(0, 5).is_empty());
        assert_eq!(plan_batches(3, 0).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn twelve_chapters_with_one_failure() {
        let registry = Arc::new(JobRegistry::new(Duration::from_secs(3600)));
        registry.create_job("b1", "Book", specs(12)).unwrap();

        let mut generator = ScriptedGenerator::new(registry.clone(), "b1", 5);
        generator.failing.insert("Chapter 8".into());
        let generator = Arc::new(generator);
        let scheduler = BatchScheduler::new(
            registry.clone(),
            generator.clone(),
            5,
            Duration::from_secs(60),
        );

        let result = scheduler.run("b1").await.unwrap();

        assert_eq!(result.total_chapters, 12);
        assert_eq!(result.completed_chapters, 11);
        assert_eq!(result.chapters[7].status, ChapterStatus::Error);
        assert_eq!(
            result
                .chapters
                .iter()
                .filter(|c| c.status == ChapterStatus::Completed)
                .count(),
            11
        );
        assert_eq!(result.chapters[0].content, "Chapter 1: Once upon a time.");
        assert_eq!(generator.calls.lock().len(), 12);
        assert!(generator.barrier_violations.lock().is_empty());

        let job = registry.get_job("b1").unwrap();
        assert_eq!(job.completed_chapters, 11);
        assert!(job.is_settled());
        assert_eq!(job.chapters[7].status, ChapterStatus::Error);
        assert_eq!(job.chapters[7].content, "Once ");
        assert_eq!(job.chapters[11].content, "Chapter 12: Once upon a time.");
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_flagged_first_chapter_is_premium() {
        let registry = Arc::new(JobRegistry::new(Duration::from_secs(3600)));
        let mut chapters = specs(3);
        chapters[0].is_hook = true;
        chapters[1].is_hook = true;
        registry.create_job("b1", "Book", chapters).unwrap();

        let generator = Arc::new(ScriptedGenerator::new(registry.clone(), "b1", 5));
        let scheduler = BatchScheduler::new(registry, generator.clone(), 5, Duration::from_secs(60));
        scheduler.run("b1").await.unwrap();

        let calls = generator.calls.lock();
        let tier_of = |title: &str| calls.iter().find(|(t, _)| t == title).map(|(_, tier)| *tier);
        assert_eq!(tier_of("Chapter 1"), Some(Tier::Premium));
        assert_eq!(tier_of("Chapter 2"), Some(Tier::Fast));
        assert_eq!(tier_of("Chapter 3"), Some(Tier::Fast));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_chapter_times_out_as_error() {
        let registry = Arc::new(JobRegistry::new(Duration::from_secs(3600)));
        registry.create_job("b1", "Book", specs(2)).unwrap();

        let mut generator = ScriptedGenerator::new(registry.clone(), "b1", 5);
        generator.delay = Duration::from_secs(30);
        let scheduler = BatchScheduler::new(
            registry.clone(),
            Arc::new(generator),
            5,
            Duration::from_secs(45),
        );

        let result = scheduler.run("b1").await.unwrap();
        assert_eq!(result.completed_chapters, 0);
        assert!(result.chapters.iter().all(|c| c.status == ChapterStatus::Error));
        assert!(registry.get_job("b1").unwrap().is_settled());
    }

    #[tokio::test]
    async fn unknown_job_is_reported() {
        let registry = Arc::new(JobRegistry::new(Duration::from_secs(3600)));
        let generator = Arc::new(ScriptedGenerator::new(registry.clone(), "none", 5));
        let scheduler = BatchScheduler::new(registry, generator, 5, Duration::from_secs(60));
        assert_eq!(
            scheduler.run("none").await.unwrap_err(),
            RegistryError::NotFound { id: "none".into() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_chapter_can_be_retried_explicitly() {
        let registry = Arc::new(JobRegistry::new(Duration::from_secs(3600)));
        registry.create_job("b1", "Book", specs(2)).unwrap();

        let mut failing = ScriptedGenerator::new(registry.clone(), "b1", 5);
        failing.failing.insert("Chapter 2".into());
        let scheduler = BatchScheduler::new(registry.clone(), Arc::new(failing), 5, Duration::from_secs(60));
        scheduler.run("b1").await.unwrap();

        assert!(matches!(
            scheduler.prepare_retry("b1", 0),
            Err(RegistryError::InvalidTransition { .. })
        ));

        let healthy = Arc::new(ScriptedGenerator::new(registry.clone(), "b1", 5));
        let retrier = BatchScheduler::new(registry.clone(), healthy, 5, Duration::from_secs(60));
        let retry = retrier.prepare_retry("b1", 1).unwrap();
        assert_eq!(registry.get_job("b1").unwrap().chapters[1].status, ChapterStatus::Pending);
        assert!(matches!(
            retrier.prepare_retry("b1", 0),
            Err(RegistryError::RunInProgress { .. })
        ));

        let chapter = retrier.run_retry(retry).await;
        assert_eq!(chapter.status, ChapterStatus::Completed);

        let job = registry.get_job("b1").unwrap();
        assert_eq!(job.completed_chapters, 2);
        assert_eq!(job.chapters[1].content, "Chapter 2: Once upon a time.");
        assert!(!job.run_active);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_is_refused_while_the_batch_run_is_in_flight() {
        let registry = Arc::new(JobRegistry::new(Duration::from_secs(3600)));
        registry.create_job("b1", "Book", specs(10)).unwrap();

        let mut generator = ScriptedGenerator::new(registry.clone(), "b1", 5);
        generator.failing.insert("Chapter 1".into());
        let scheduler = BatchScheduler::new(registry.clone(), Arc::new(generator), 5, Duration::from_secs(60));

        let run = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run("b1").await }
        });

        // Batch one settles after three 10ms fragments; batch two is mid-flight.
        tokio::time::sleep(Duration::from_millis(45)).await;
        let job = registry.get_job("b1").unwrap();
        assert_eq!(job.chapters[0].status, ChapterStatus::Error);
        assert_eq!(job.count_with(ChapterStatus::Generating), 5);

        assert_eq!(
            scheduler.prepare_retry("b1", 0).unwrap_err(),
            RegistryError::RunInProgress { id: "b1".into() }
        );
        assert_eq!(registry.get_job("b1").unwrap().chapters[0].status, ChapterStatus::Error);

        let result = run.await.unwrap().unwrap();
        let job = registry.get_job("b1").unwrap();
        assert_eq!(result.completed_chapters, 9);
        assert_eq!(job.completed_chapters, 9);
        assert_eq!(result.chapters[0].status, job.chapters[0].status);

        assert!(scheduler.prepare_retry("b1", 0).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn a_second_run_of_the_same_job_is_refused() {
        let registry = Arc::new(JobRegistry::new(Duration::from_secs(3600)));
        registry.create_job("b1", "Book", specs(2)).unwrap();
        let generator = Arc::new(ScriptedGenerator::new(registry.clone(), "b1", 5));
        let scheduler = BatchScheduler::new(registry.clone(), generator.clone(), 5, Duration::from_secs(60));

        let (first, second) = tokio::join!(scheduler.run("b1"), scheduler.run("b1"));
        assert_eq!(first.unwrap().completed_chapters, 2);
        assert_eq!(second.unwrap_err(), RegistryError::RunInProgress { id: "b1".into() });
        assert_eq!(generator.calls.lock().len(), 2);
    }
}
