//! In-process job queue.
//!
//! Same claim/redelivery/event semantics as the RabbitMQ backend, without a
//! broker. Jobs live only as long as the process, so this backend is meant for
//! tests and single-process embedding.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, info, warn};

use super::types::{Job, JobEvent, JobId, JobPayload, JobStatus};
use super::{ClaimedJob, Disposition, JobQueue, Receipt, RedeliveryPolicy, Subscription};
use crate::error::QueueError;

const EVENT_BUFFER: usize = 1024;

/// Number of finished jobs whose status stays queryable.
pub const DEFAULT_RETAINED_JOBS: usize = 10_000;

/// Memory-backed [`JobQueue`].
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    state: Mutex<State>,
    notify: Notify,
    events: broadcast::Sender<JobEvent>,
    policy: RedeliveryPolicy,
    retained: usize,
}

#[derive(Default)]
struct State {
    waiting: VecDeque<Job>,
    records: HashMap<JobId, Record>,
    /// Finished jobs, oldest first
    finished: VecDeque<JobId>,
    closed: bool,
    unavailable: bool,
}

struct Record {
    status: JobStatus,
    failure_reason: Option<String>,
}

impl MemoryQueue {
    pub fn new(policy: RedeliveryPolicy) -> Self {
        Self::with_retention(policy, DEFAULT_RETAINED_JOBS)
    }

    /// Queue that remembers the status of at most `retained` finished jobs.
    ///
    /// Waiting and active jobs are always tracked.
    pub fn with_retention(policy: RedeliveryPolicy, retained: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                events,
                policy,
                retained: retained.max(1),
            }),
        }
    }

    /// Current status of a job, if the queue has seen it recently.
    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        self.inner.lock().records.get(id).map(|r| r.status)
    }

    /// Failure reason recorded for a failed job.
    pub fn failure_reason(&self, id: &JobId) -> Option<String> {
        self.inner
            .lock()
            .records
            .get(id)
            .and_then(|r| r.failure_reason.clone())
    }

    /// Number of jobs waiting to be claimed.
    pub fn waiting(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// Simulate the backing store refusing writes.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.lock().unavailable = unavailable;
    }

    /// Stop handing out jobs; pending `claim` calls return `None`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.notify.notify_waiters();
        info!("memory_queue_closed");
    }
}

impl MemoryInner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // A poisoned lock only means another thread panicked mid-update;
        // the queue state itself is still consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, job: Job) {
        {
            let mut state = self.lock();
            state.records.insert(
                job.id.clone(),
                Record {
                    status: JobStatus::Waiting,
                    failure_reason: None,
                },
            );
            state.waiting.push_back(job);
        }
        self.notify.notify_one();
    }

    fn finish(&self, id: &JobId, status: JobStatus, reason: Option<String>) {
        let mut state = self.lock();
        if let Some(record) = state.records.get_mut(id) {
            record.status = status;
            record.failure_reason = reason;
        }
        if !status.is_terminal() {
            return;
        }

        state.finished.push_back(id.clone());
        while state.finished.len() > self.retained {
            if let Some(oldest) = state.finished.pop_front() {
                state.records.remove(&oldest);
            }
        }
    }

    fn publish(&self, event: JobEvent) {
        // No subscribers is fine; events are advisory.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, kind: &str, payload: JobPayload) -> Result<JobId, QueueError> {
        {
            let state = self.inner.lock();
            if state.unavailable || state.closed {
                return Err(QueueError::Unavailable(
                    "memory queue is not accepting jobs".to_string(),
                ));
            }
        }

        let job = Job::new(kind, payload);
        let id = job.id.clone();
        self.inner.push(job);

        debug!(job_id = %id, kind = kind, "memory_job_enqueued");
        Ok(id)
    }

    async fn claim(&self) -> Result<Option<ClaimedJob>, QueueError> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.lock();
                if let Some(job) = state.waiting.pop_front() {
                    if let Some(record) = state.records.get_mut(&job.id) {
                        record.status = JobStatus::Active;
                    }
                    return Ok(Some(ClaimedJob {
                        job,
                        receipt: Receipt::Memory,
                    }));
                }
                if state.closed {
                    return Ok(None);
                }
            }

            notified.await;
        }
    }

    async fn complete(&self, claim: ClaimedJob) -> Result<(), QueueError> {
        let id = claim.job.id;
        self.inner.finish(&id, JobStatus::Completed, None);
        self.inner.publish(JobEvent::completed(id));
        Ok(())
    }

    async fn fail(&self, claim: ClaimedJob, reason: String) -> Result<Disposition, QueueError> {
        let job = claim.job;
        let policy = self.inner.policy;

        if policy.should_retry(job.attempt) {
            let next = job.redelivery();
            let delay = policy.delay_for(job.attempt);
            let attempt = next.attempt;
            self.inner.finish(&job.id, JobStatus::Waiting, None);

            warn!(
                job_id = %job.id,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "memory_job_redelivery_scheduled"
            );

            if delay.is_zero() {
                self.inner.push(next);
            } else {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    inner.push(next);
                });
            }
            return Ok(Disposition::Redelivered { attempt, delay });
        }

        self.inner
            .finish(&job.id, JobStatus::Failed, Some(reason.clone()));
        self.inner.publish(JobEvent::failed(job.id, reason));
        Ok(Disposition::Failed)
    }

    async fn subscribe(&self) -> Result<Subscription, QueueError> {
        let mut events = self.inner.events.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "memory_subscription_lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(rx, task))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::queue::PROCESS_EMAIL;

    fn queue(max_attempts: u32) -> MemoryQueue {
        MemoryQueue::new(RedeliveryPolicy {
            max_attempts,
            backoff: Duration::ZERO,
        })
    }

    fn payload() -> JobPayload {
        JobPayload::submitted("hello".to_string(), "a@x.com".to_string())
    }

    #[tokio::test]
    async fn test_enqueue_then_claim_marks_active() {
        let queue = queue(1);
        let id = queue.enqueue(PROCESS_EMAIL, payload()).await.unwrap();
        assert_eq!(queue.status(&id), Some(JobStatus::Waiting));

        let claim = queue.claim().await.unwrap().unwrap();
        assert_eq!(claim.job.id, id);
        assert_eq!(claim.job.kind, PROCESS_EMAIL);
        assert_eq!(queue.status(&id), Some(JobStatus::Active));
    }

    #[tokio::test]
    async fn test_complete_emits_event() {
        let queue = queue(1);
        let mut events = queue.subscribe().await.unwrap();
        let id = queue.enqueue(PROCESS_EMAIL, payload()).await.unwrap();

        let claim = queue.claim().await.unwrap().unwrap();
        queue.complete(claim).await.unwrap();

        let event = events.next().await.unwrap();
        assert_eq!(event.job_id, id);
        assert_eq!(event.status, JobStatus::Completed);
        assert_eq!(queue.status(&id), Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn test_fail_redelivers_until_attempts_exhausted() {
        let queue = queue(2);
        let mut events = queue.subscribe().await.unwrap();
        let id = queue.enqueue(PROCESS_EMAIL, payload()).await.unwrap();

        let first = queue.claim().await.unwrap().unwrap();
        let disposition = queue.fail(first, "SendError: boom".to_string()).await.unwrap();
        assert!(matches!(disposition, Disposition::Redelivered { attempt: 2, .. }));

        let second = queue.claim().await.unwrap().unwrap();
        assert_eq!(second.job.id, id);
        assert_eq!(second.job.attempt, 2);

        let disposition = queue.fail(second, "SendError: boom".to_string()).await.unwrap();
        assert_eq!(disposition, Disposition::Failed);
        assert_eq!(queue.status(&id), Some(JobStatus::Failed));
        assert_eq!(queue.failure_reason(&id).as_deref(), Some("SendError: boom"));

        let event = events.next().await.unwrap();
        assert_eq!(event.status, JobStatus::Failed);
        assert_eq!(event.reason.as_deref(), Some("SendError: boom"));
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_enqueue() {
        let queue = queue(1);
        queue.set_unavailable(true);
        let result = queue.enqueue(PROCESS_EMAIL, payload()).await;
        assert!(matches!(result, Err(QueueError::Unavailable(_))));
        assert_eq!(queue.waiting(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_claim() {
        let queue = queue(1);
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim().await })
        };

        tokio::task::yield_now().await;
        queue.close();

        let claimed = waiter.await.unwrap().unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_each_job_claimed_once() {
        let queue = queue(1);
        queue.enqueue(PROCESS_EMAIL, payload()).await.unwrap();
        queue.enqueue(PROCESS_EMAIL, payload()).await.unwrap();

        let a = queue.claim().await.unwrap().unwrap();
        let b = queue.claim().await.unwrap().unwrap();
        assert_ne!(a.job.id, b.job.id);
        assert_eq!(queue.waiting(), 0);
    }

    #[tokio::test]
    async fn test_finished_records_are_bounded() {
        let queue = MemoryQueue::with_retention(
            RedeliveryPolicy {
                max_attempts: 1,
                backoff: Duration::ZERO,
            },
            2,
        );

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = queue.enqueue(PROCESS_EMAIL, payload()).await.unwrap();
            let claim = queue.claim().await.unwrap().unwrap();
            queue.complete(claim).await.unwrap();
            ids.push(id);
        }

        let pending = queue.enqueue(PROCESS_EMAIL, payload()).await.unwrap();

        assert_eq!(queue.status(&ids[0]), None);
        assert_eq!(queue.status(&ids[1]), Some(JobStatus::Completed));
        assert_eq!(queue.status(&ids[2]), Some(JobStatus::Completed));
        assert_eq!(queue.status(&pending), Some(JobStatus::Waiting));
    }

    async fn wait_for_receivers(queue: &MemoryQueue, expected: usize) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while queue.inner.events.receiver_count() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscription task still running");
    }

    #[tokio::test]
    async fn test_cancel_and_drop_end_subscriptions() {
        let queue = queue(1);
        let cancelled = queue.subscribe().await.unwrap();
        let dropped = queue.subscribe().await.unwrap();
        let mut kept = queue.subscribe().await.unwrap();
        wait_for_receivers(&queue, 3).await;

        cancelled.cancel();
        drop(dropped);
        wait_for_receivers(&queue, 1).await;

        let id = queue.enqueue(PROCESS_EMAIL, payload()).await.unwrap();
        let claim = queue.claim().await.unwrap().unwrap();
        queue.complete(claim).await.unwrap();
        assert_eq!(kept.next().await.unwrap().job_id, id);
    }
}
