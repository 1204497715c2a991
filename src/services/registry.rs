//! Process-wide store of book generation jobs.
//!
//! The registry is the only place chapter state changes: the scheduler sends
//! [`ChapterUpdate`] commands through [`JobRegistry::mutate_chapter`], progress
//! readers only ever look. Jobs are evicted a fixed delay after creation (a
//! retry pushes that back); the evicted id is remembered for a while so late
//! readers can tell "gone" from "not created yet".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::models::{BookJob, ChapterJob, ChapterSpec, ChapterStatus};

/// A state transition for one chapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChapterUpdate {
    /// `pending -> generating`
    Start,
    /// Append a streamed fragment while `generating`.
    Append(String),
    /// `generating -> completed` with the full text.
    Complete(String),
    /// `generating -> error`
    Fail,
    /// `error -> pending`, clearing partial content. Used by explicit retries.
    Reset,
}

impl ChapterUpdate {
    fn action(&self) -> &'static str {
        match self {
            ChapterUpdate::Start => "start",
            ChapterUpdate::Append(_) => "append",
            ChapterUpdate::Complete(_) => "complete",
            ChapterUpdate::Fail => "fail",
            ChapterUpdate::Reset => "reset",
        }
    }
}

/// Result of a read against the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    /// Never seen, or the tombstone has expired.
    Missing,
    /// Existed and was evicted recently.
    Evicted,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<String, BookJob>,
    tombstones: HashMap<String, Instant>,
}

impl RegistryState {
    /// Removes `id` and remembers it as evicted, dropping expired tombstones.
    fn bury(&mut self, id: &str, now: Instant, ttl: Duration) -> Option<BookJob> {
        self.tombstones
            .retain(|_, evicted_at| now.duration_since(*evicted_at) < ttl);
        let job = self.jobs.remove(id)?;
        self.tombstones.insert(id.to_string(), now);
        Some(job)
    }
}

/// Keeps a job marked as running until dropped. At most one lease exists per
/// job, so a batch run and a retry never overlap.
pub struct RunLease {
    registry: Arc<JobRegistry>,
    id: String,
    instance: Uuid,
}

impl std::fmt::Debug for RunLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLease")
            .field("id", &self.id)
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        let mut state = self.registry.state.lock();
        if let Some(job) = state
            .jobs
            .get_mut(&self.id)
            .filter(|job| job.instance == self.instance)
        {
            job.run_active = false;
        }
    }
}

pub struct JobRegistry {
    state: Mutex<RegistryState>,
    tombstone_ttl: Duration,
}

impl JobRegistry {
    pub fn new(tombstone_ttl: Duration) -> Self {
        JobRegistry {
            state: Mutex::new(RegistryState::default()),
            tombstone_ttl,
        }
    }

    /// Stores a new job with every chapter `pending`. Returns the instance id
    /// to pass to [`JobRegistry::schedule_eviction`].
    pub fn create_job(
        &self,
        id: &str,
        book_title: &str,
        specs: Vec<ChapterSpec>,
    ) -> Result<Uuid, RegistryError> {
        let mut state = self.state.lock();
        if state.jobs.contains_key(id) {
            return Err(RegistryError::DuplicateJob { id: id.to_string() });
        }

        let job = BookJob::new(id, book_title, specs);
        let instance = job.instance;
        tracing::info!(
            book_id = id,
            total_chapters = job.total_chapters,
            "job created"
        );
        state.tombstones.remove(id);
        state.jobs.insert(id.to_string(), job);
        Ok(instance)
    }

    /// Returns a copy of the job, content included.
    #[cfg(test)]
    pub fn get_job(&self, id: &str) -> Option<BookJob> {
        self.state.lock().jobs.get(id).cloned()
    }

    /// Runs `read` against the job without copying it.
    pub fn lookup<R>(&self, id: &str, read: impl FnOnce(&BookJob) -> R) -> Lookup<R> {
        let state = self.state.lock();
        if let Some(job) = state.jobs.get(id) {
            return Lookup::Found(read(job));
        }
        match state.tombstones.get(id) {
            Some(evicted_at) if evicted_at.elapsed() < self.tombstone_ttl => Lookup::Evicted,
            _ => Lookup::Missing,
        }
    }

    /// Marks the job as running. Fails while another run or retry holds it.
    pub fn begin_run(self: &Arc<Self>, id: &str) -> Result<RunLease, RegistryError> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
        if job.run_active {
            return Err(RegistryError::RunInProgress { id: id.to_string() });
        }
        job.run_active = true;
        Ok(RunLease {
            registry: Arc::clone(self),
            id: id.to_string(),
            instance: job.instance,
        })
    }

    /// Applies one transition to one chapter. Returns the chapter's new
    /// status. Illegal transitions leave the job untouched.
    pub fn mutate_chapter(
        &self,
        id: &str,
        index: usize,
        update: ChapterUpdate,
    ) -> Result<ChapterStatus, RegistryError> {
        let mut state = self.state.lock();
        let job = state
            .jobs
            .get_mut(id)
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })?;
        let chapter =
            job.chapters
                .get_mut(index)
                .ok_or_else(|| RegistryError::ChapterOutOfRange {
                    id: id.to_string(),
                    index,
                })?;

        let completed = apply(chapter, update)?;
        if completed {
            job.completed_chapters += 1;
        }
        Ok(chapter.status)
    }

    /// Removes a job immediately. Open channels see it as evicted.
    pub fn remove(&self, id: &str) -> Option<BookJob> {
        self.state
            .lock()
            .bury(id, Instant::now(), self.tombstone_ttl)
    }

    /// Evicts the job if it is still the same instance and its retention has
    /// run out. Returns whether anything was removed.
    pub fn evict(&self, id: &str, instance: Uuid) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let due = state
            .jobs
            .get(id)
            .is_some_and(|job| job.instance == instance && now >= job.retain_until);
        due && state.bury(id, now, self.tombstone_ttl).is_some()
    }

    /// Arms a one-shot timer that evicts the job after `delay`, whether or not
    /// it has finished.
    pub fn schedule_eviction(
        self: &Arc<Self>,
        id: &str,
        instance: Uuid,
        delay: Duration,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let id = id.to_string();
        let deadline = Instant::now() + delay;
        if let Some(job) = self
            .state
            .lock()
            .jobs
            .get_mut(&id)
            .filter(|job| job.instance == instance)
        {
            job.retain_until = job.retain_until.max(deadline);
        }
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if registry.evict(&id, instance) {
                tracing::info!(book_id = %id, after_secs = delay.as_secs(), "job evicted");
            } else {
                tracing::debug!(book_id = %id, "eviction skipped, job retained, replaced or removed");
            }
        })
    }

    /// Pushes the job's eviction back to `delay` from now. Returns `None` when
    /// the job is gone.
    pub fn extend_retention(self: &Arc<Self>, id: &str, delay: Duration) -> Option<JoinHandle<()>> {
        let instance = self.lookup(id, |job| job.instance).found()?;
        Some(self.schedule_eviction(id, instance, delay))
    }
}

/// Returns `true` when the chapter has just become `completed`.
fn apply(chapter: &mut ChapterJob, update: ChapterUpdate) -> Result<bool, RegistryError> {
    use ChapterStatus::*;

    let invalid = |chapter: &ChapterJob, update: &ChapterUpdate| RegistryError::InvalidTransition {
        index: chapter.index,
        from: chapter.status,
        action: update.action(),
    };

    match (chapter.status, update) {
        (Pending, ChapterUpdate::Start) => {
            chapter.status = Generating;
            Ok(false)
        }
        (Generating, ChapterUpdate::Append(fragment)) => {
            chapter.content.push_str(&fragment);
            Ok(false)
        }
        (Generating, ChapterUpdate::Complete(content)) => {
            chapter.content = content;
            chapter.status = Completed;
            Ok(true)
        }
        (Generating, ChapterUpdate::Fail) => {
            chapter.status = Error;
            Ok(false)
        }
        (Error, ChapterUpdate::Reset) => {
            chapter.content.clear();
            chapter.status = Pending;
            Ok(false)
        }
        (_, update) => Err(invalid(chapter, &update)),
    }
}
