//! Completion reporting.
//!
//! Consumes the queue's event stream and records the terminal state of each
//! job. It only observes: nothing here retries or otherwise changes a job.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::queue::{JobEvent, JobId, JobStatus, Subscription};

/// Number of terminal events kept for deduplication.
pub const DEFAULT_RETAINED_EVENTS: usize = 10_000;

/// Most recent terminal events keyed by job id.
///
/// Events arrive at-least-once; the first terminal event per job wins and
/// duplicates are ignored. Only the newest `capacity` jobs are remembered,
/// oldest evicted first, so a duplicate arriving after eviction is recorded
/// again.
#[derive(Clone)]
pub struct CompletionLog {
    inner: Arc<Mutex<Recorded>>,
    capacity: usize,
}

#[derive(Default)]
struct Recorded {
    events: HashMap<JobId, JobEvent>,
    order: VecDeque<JobId>,
}

impl Default for CompletionLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RETAINED_EVENTS)
    }
}

impl CompletionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Recorded::default())),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record an event. Returns `false` for a duplicate or non-terminal event.
    pub fn record(&self, event: JobEvent) -> bool {
        if !event.status.is_terminal() {
            warn!(
                job_id = %event.job_id,
                status = ?event.status,
                "completion_non_terminal_ignored"
            );
            return false;
        }

        let mut recorded = self.lock();
        if recorded.events.contains_key(&event.job_id) {
            debug!(job_id = %event.job_id, "completion_duplicate_ignored");
            return false;
        }

        match event.status {
            JobStatus::Failed => warn!(
                job_id = %event.job_id,
                reason = event.reason.as_deref().unwrap_or("unknown"),
                "job_has_failed"
            ),
            _ => info!(job_id = %event.job_id, "job_has_completed"),
        }

        while recorded.order.len() >= self.capacity {
            if let Some(oldest) = recorded.order.pop_front() {
                recorded.events.remove(&oldest);
            }
        }
        recorded.order.push_back(event.job_id.clone());
        recorded.events.insert(event.job_id.clone(), event);
        true
    }

    pub fn get(&self, id: &JobId) -> Option<JobEvent> {
        self.lock().events.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }
}

/// Spawn a task that feeds `subscription` into `log`.
///
/// The task runs until the stream ends or `shutdown` flips to `true`, at
/// which point the subscription is cancelled.
pub fn spawn_reporter(
    mut subscription: Subscription,
    log: CompletionLog,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("completion_reporter_started");
        loop {
            if *shutdown.borrow() {
                subscription.cancel();
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        subscription.cancel();
                        break;
                    }
                }
                event = subscription.next() => match event {
                    Some(event) => {
                        log.record(event);
                    }
                    None => break,
                },
            }
        }
        info!(recorded = log.len(), "completion_reporter_stopped");
    })
}
