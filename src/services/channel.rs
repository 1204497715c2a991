//! Per-subscriber progress push loop.
//!
//! Each subscriber gets its own task that reads the registry on a fixed
//! interval and pushes a full [`ProgressEvent`] per tick. The task is bound
//! to a [`CancellationToken`]: the token is checked at the top of every tick
//! and is cancelled on completion, timeout, transport failure, or when the
//! subscriber drops its [`ProgressStream`].
//!
//! ```text
//! Init ──job found──▶ Streaming ──complete──▶ Closed
//!   │                    │  └──job gone──▶ "Not found" ──▶ Closed
//!   └─no job─▶ Waiting ──┘
//!                │
//!                └─attempts exhausted / evicted─▶ "Not found" ──▶ Closed
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::models::{ProgressEvent, WaitingNotice};
use crate::services::progress;
use crate::services::registry::{JobRegistry, Lookup};

const WAITING_MESSAGE: &str = "Preparing book generation...";

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub interval: Duration,
    pub max_wait_attempts: u32,
    pub timeout: Duration,
    pub buffer: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        ChannelSettings {
            interval: Duration::from_secs(1),
            max_wait_attempts: 15,
            timeout: Duration::from_secs(10 * 60),
            buffer: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Init,
    Waiting { attempts: u32 },
    Streaming,
}

/// What a tick produced: the event to push and whether it is the last one.
struct Emission {
    event: ProgressEvent,
    last: bool,
}

pub struct ProgressChannel {
    registry: Arc<JobRegistry>,
    book_id: String,
    settings: ChannelSettings,
    phase: Phase,
}

impl ProgressChannel {
    pub fn new(registry: Arc<JobRegistry>, book_id: &str, settings: ChannelSettings) -> Self {
        ProgressChannel {
            registry,
            book_id: book_id.to_string(),
            settings,
            phase: Phase::Init,
        }
    }

    /// Spawns the push loop. Dropping the returned stream cancels it.
    pub fn open(self) -> ProgressStream {
        self.open_with(CancellationToken::new())
    }

    pub fn open_with(self, cancel: CancellationToken) -> ProgressStream {
        let (tx, rx) = mpsc::channel(self.settings.buffer.max(1));
        let guard = cancel.clone().drop_guard();
        tokio::spawn(self.drive(tx, cancel));
        ProgressStream {
            events: ReceiverStream::new(rx),
            _guard: guard,
        }
    }

    async fn drive(mut self, tx: mpsc::Sender<ProgressEvent>, cancel: CancellationToken) {
        let book_id = self.book_id.clone();
        tracing::info!(book_id = %book_id, "progress stream started");

        let deadline = Instant::now() + self.settings.timeout;
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::info!(book_id = %book_id, "progress stream cancelled by client");
                    break;
                }
                () = tokio::time::sleep_until(deadline) => {
                    tracing::warn!(book_id = %book_id, "progress stream timed out");
                    break;
                }
                _ = ticker.tick() => {}
            }

            if cancel.is_cancelled() {
                break;
            }

            let Emission { event, last } = self.tick(Instant::now());

            if last {
                // The closing event must not be dropped for a slow reader.
                tokio::select! {
                    () = cancel.cancelled() => {}
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            tracing::debug!(book_id = %book_id, "subscriber gone before final event");
                        }
                    }
                }
                break;
            }

            match tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    // The next tick carries the full state again.
                    tracing::debug!(book_id = %book_id, "subscriber lagging, tick skipped");
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::info!(book_id = %book_id, "subscriber disconnected");
                    break;
                }
            }
        }

        cancel.cancel();
    }

    fn tick(&mut self, now: Instant) -> Emission {
        let lookup = self.registry.lookup(&self.book_id, |job| {
            let snapshot = progress::snapshot(job, now, false);
            (snapshot, progress::failed_chapters(job))
        });

        match lookup {
            Lookup::Found((snapshot, failed)) => {
                self.phase = Phase::Streaming;
                let last = snapshot.is_complete;
                if last {
                    tracing::info!(
                        book_id = %self.book_id,
                        completed = snapshot.completed_chapters,
                        failed,
                        "progress stream completed"
                    );
                }
                Emission {
                    event: ProgressEvent::Snapshot(snapshot),
                    last,
                }
            }
            Lookup::Evicted => {
                tracing::warn!(book_id = %self.book_id, "job already evicted");
                self.not_found()
            }
            Lookup::Missing => match self.phase {
                Phase::Streaming => {
                    tracing::warn!(book_id = %self.book_id, "job disappeared while streaming");
                    self.not_found()
                }
                Phase::Init | Phase::Waiting { .. } => {
                    let attempts = match self.phase {
                        Phase::Waiting { attempts } => attempts + 1,
                        _ => 1,
                    };
                    if attempts > self.settings.max_wait_attempts {
                        tracing::error!(book_id = %self.book_id, attempts, "progress not found after waiting");
                        return self.not_found();
                    }
                    self.phase = Phase::Waiting { attempts };
                    Emission {
                        event: ProgressEvent::Waiting(WaitingNotice {
                            book_id: self.book_id.clone(),
                            waiting: true,
                            message: WAITING_MESSAGE.to_string(),
                            attempts,
                        }),
                        last: false,
                    }
                }
            },
        }
    }

    fn not_found(&self) -> Emission {
        Emission {
            event: ProgressEvent::not_found(),
            last: true,
        }
    }
}

/// Receiving end of a progress channel. Dropping it stops the push loop.
pub struct ProgressStream {
    events: ReceiverStream<ProgressEvent>,
    _guard: DropGuard,
}

impl Stream for ProgressStream {
    type Item = ProgressEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}
