use crate::{
    clock::Clock,
    config::QueueConfig,
    fetch::{Disposition, ItemFetcher},
    models::{DateRange, FetchJob, ItemFetchResult, JobMode, JobStatus, SellerStatus},
    store::{Repository, StoreError},
};
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const MAX_ITEMS_PER_JOB: usize = 100;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("seller {0} not found")]
    SellerNotFound(String),
    #[error("seller {seller_id} is {status}")]
    SellerInactive {
        seller_id: String,
        status: SellerStatus,
    },
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("{0}")]
    Conflict(String),
    #[error("task queue is closed")]
    QueueClosed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    StartJob { job_id: Uuid },
    FetchItem { job_id: Uuid, item_id: String },
    CheckCompletion { job_id: Uuid },
}

#[derive(Debug, Clone)]
struct Envelope {
    task: Task,
    attempt: u32,
}

/// Sending half of the in-process task queue.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Envelope>,
}

pub struct TaskReceiver {
    rx: mpsc::Receiver<Envelope>,
}

impl TaskQueue {
    pub fn channel(capacity: usize) -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, TaskReceiver { rx })
    }

    pub async fn enqueue(&self, task: Task) -> Result<(), JobError> {
        self.send(Envelope { task, attempt: 0 }).await
    }

    async fn send(&self, envelope: Envelope) -> Result<(), JobError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|_| JobError::QueueClosed)
    }
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub seller_id: String,
    /// Defaults to the marketplace or shop the seller authorized.
    pub marketplace_id: Option<String>,
    pub item_ids: Vec<String>,
    pub date_range: Option<DateRange>,
    pub mode: JobMode,
    pub requested_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub job: FetchJob,
    /// True when an idempotency key mapped the request to an earlier job.
    pub reused: bool,
}

/// Trims, drops blanks, and keeps the first occurrence of each id.
fn dedupe_items(item_ids: &[String]) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(item_ids.len());
    for id in item_ids.iter().map(|id| id.trim()).filter(|id| !id.is_empty()) {
        if !unique.iter().any(|seen| seen == id) {
            unique.push(id.to_string());
        }
    }
    unique
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / 1000.0).max(0.0)
}

pub struct JobService {
    repo: Arc<dyn Repository>,
    queue: TaskQueue,
    clock: Arc<dyn Clock>,
    idempotency_ttl: Duration,
}

impl JobService {
    pub fn new(
        repo: Arc<dyn Repository>,
        queue: TaskQueue,
        clock: Arc<dyn Clock>,
        idempotency_ttl: Duration,
    ) -> Self {
        Self {
            repo,
            queue,
            clock,
            idempotency_ttl,
        }
    }

    pub async fn submit(
        &self,
        request: SubmitRequest,
        idempotency_key: Option<&str>,
    ) -> Result<Submission, JobError> {
        let item_ids = dedupe_items(&request.item_ids);
        if item_ids.is_empty() || item_ids.len() > MAX_ITEMS_PER_JOB {
            return Err(JobError::InvalidRequest(format!(
                "item_ids must contain between 1 and {MAX_ITEMS_PER_JOB} distinct ids"
            )));
        }
        if let Some(DateRange {
            start: Some(start),
            end: Some(end),
        }) = request.date_range
            && start > end
        {
            return Err(JobError::InvalidRequest(
                "date_range start must not be after end".into(),
            ));
        }

        let seller = self
            .repo
            .get_seller(&request.seller_id)
            .await?
            .ok_or_else(|| JobError::SellerNotFound(request.seller_id.clone()))?;
        if seller.status != SellerStatus::Active {
            return Err(JobError::SellerInactive {
                seller_id: seller.id,
                status: seller.status,
            });
        }

        let now = self.clock.now();
        let job = FetchJob {
            id: Uuid::new_v4(),
            seller_id: seller.id.clone(),
            platform: seller.platform,
            marketplace_id: request
                .marketplace_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| seller.marketplace_id.clone()),
            total_items: item_ids.len() as u32,
            item_ids,
            date_range: request.date_range,
            mode: request.mode,
            status: JobStatus::Pending,
            completed_items: 0,
            failed_items: 0,
            total_reviews_fetched: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            raw_locations: Vec::new(),
            processed_locations: Vec::new(),
            error_message: None,
            requested_by: request.requested_by,
        };

        if let Some(key) = idempotency_key
            && let Some(existing) = self
                .repo
                .claim_idempotency_key(&job.seller_id, key, job.id, now, self.idempotency_ttl)
                .await?
        {
            let job = self.repo.get_job(existing).await?.ok_or_else(|| {
                JobError::Conflict("a submission with this Idempotency-Key is in progress".into())
            })?;
            info!(target = "reviews.jobs", job_id = %job.id, "idempotent replay of job submission");
            return Ok(Submission { job, reused: true });
        }

        self.repo.insert_job(job.clone()).await?;
        self.queue.enqueue(Task::StartJob { job_id: job.id }).await?;
        info!(
            target = "reviews.jobs",
            job_id = %job.id,
            seller_id = %job.seller_id,
            platform = %job.platform,
            items = job.total_items,
            "job submitted"
        );
        Ok(Submission { job, reused: false })
    }

    /// Fan-out. Only the call that moves the job out of `pending` enqueues
    /// item tasks, so a redelivered start is a no-op.
    pub async fn start(&self, job_id: Uuid) -> Result<(), JobError> {
        let now = self.clock.now();
        let mut started = false;
        let job = self
            .repo
            .update_job(job_id, &mut |row| {
                started = row.status == JobStatus::Pending;
                if started {
                    row.status = JobStatus::InProgress;
                    row.started_at = Some(now);
                    row.total_items = row.item_ids.len() as u32;
                }
            })
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        if !started {
            debug!(target = "reviews.jobs", job_id = %job_id, status = %job.status, "job already started");
            return Ok(());
        }

        for item_id in &job.item_ids {
            self.queue
                .enqueue(Task::FetchItem {
                    job_id,
                    item_id: item_id.clone(),
                })
                .await?;
        }
        info!(target = "reviews.jobs", job_id = %job_id, items = job.total_items, "job started");
        Ok(())
    }

    /// Derives the job's state from its item results. Safe to call any
    /// number of times; the terminal transition happens once.
    pub async fn check_completion(&self, job_id: Uuid) -> Result<FetchJob, JobError> {
        let job = self
            .repo
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        if job.status != JobStatus::InProgress {
            return Ok(job);
        }

        let items = self.repo.items_for_job(job_id).await?;
        let succeeded = items
            .iter()
            .filter(|item| item.status == JobStatus::Success)
            .count() as u32;
        let failed_items: Vec<_> = items
            .iter()
            .filter(|item| item.status == JobStatus::Failed)
            .collect();
        let failed = failed_items.len() as u32;
        let total_reviews: u64 = items.iter().map(|item| item.reviews_count).sum();
        let last_error = failed_items
            .iter()
            .max_by_key(|item| item.completed_at)
            .and_then(|item| item.error_message.clone());

        let outcome = (job.total_items > 0 && succeeded + failed >= job.total_items).then(|| {
            match (succeeded, failed) {
                (_, 0) => JobStatus::Success,
                (0, _) => JobStatus::Failed,
                _ => JobStatus::PartialSuccess,
            }
        });
        let raw_locations: Vec<String> = items
            .iter()
            .flat_map(|item| item.raw_locations.iter().cloned())
            .collect();
        let processed_locations: Vec<String> = items
            .iter()
            .filter_map(|item| item.processed_location.clone())
            .collect();

        let now = self.clock.now();
        let mut finished = false;
        let updated = self
            .repo
            .update_job(job_id, &mut |row| {
                finished = false;
                if row.status.is_terminal() {
                    return;
                }
                row.completed_items = row.completed_items.max(succeeded);
                row.failed_items = row.failed_items.max(failed);
                row.total_reviews_fetched = row.total_reviews_fetched.max(total_reviews);
                if let Some(status) = outcome
                    && row.status.can_transition_to(status)
                {
                    row.status = status;
                    row.completed_at = Some(now);
                    row.duration_seconds = row.started_at.map(|started| seconds_between(started, now));
                    row.raw_locations = raw_locations.clone();
                    row.processed_locations = processed_locations.clone();
                    row.error_message = last_error.clone();
                    finished = true;
                }
            })
            .await?
            .ok_or(JobError::NotFound(job_id))?;

        if finished {
            info!(
                target = "reviews.jobs",
                job_id = %job_id,
                status = %updated.status,
                completed = updated.completed_items,
                failed = updated.failed_items,
                reviews = updated.total_reviews_fetched,
                "job finished"
            );
        }
        Ok(updated)
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<FetchJob, JobError> {
        let now = self.clock.now();
        let mut cancelled = false;
        let job = self
            .repo
            .update_job(job_id, &mut |row| {
                cancelled = !row.status.is_terminal();
                if cancelled {
                    row.status = JobStatus::Cancelled;
                    row.completed_at = Some(now);
                    row.duration_seconds = row.started_at.map(|started| seconds_between(started, now));
                }
            })
            .await?
            .ok_or(JobError::NotFound(job_id))?;
        if !cancelled {
            return Err(JobError::Conflict(format!(
                "job {job_id} already finished as {}",
                job.status
            )));
        }
        info!(target = "reviews.jobs", job_id = %job_id, "job cancelled");
        Ok(job)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<FetchJob, JobError> {
        self.repo
            .get_job(job_id)
            .await?
            .ok_or(JobError::NotFound(job_id))
    }

    pub async fn items(&self, job_id: Uuid) -> Result<Vec<ItemFetchResult>, JobError> {
        self.get(job_id).await?;
        Ok(self.repo.items_for_job(job_id).await?)
    }

    pub async fn jobs_for_seller(&self, seller_id: &str) -> Result<Vec<FetchJob>, JobError> {
        Ok(self.repo.jobs_for_seller(seller_id).await?)
    }
}

/// Executes queued tasks on a bounded pool of concurrent tokio tasks.
pub struct Worker {
    jobs: Arc<JobService>,
    fetcher: Arc<ItemFetcher>,
    queue: TaskQueue,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl Worker {
    pub fn new(
        jobs: Arc<JobService>,
        fetcher: Arc<ItemFetcher>,
        queue: TaskQueue,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        Self {
            jobs,
            fetcher,
            queue,
            clock,
            config,
        }
    }

    pub fn spawn(self, receiver: TaskReceiver) -> JoinHandle<()> {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let worker = Arc::new(self);
        let mut rx = receiver.rx;

        tokio::spawn(async move {
            // A task is received only once a permit is free, so the channel
            // capacity bounds the backlog. Handlers release their permit
            // before enqueueing follow-up tasks.
            loop {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let Some(envelope) = rx.recv().await else {
                    break;
                };
                let worker = worker.clone();
                tokio::spawn(async move {
                    worker.handle(envelope, permit).await;
                });
            }
            info!(target = "reviews.queue", "task queue closed; worker stopped");
        })
    }

    async fn handle(&self, envelope: Envelope, permit: OwnedSemaphorePermit) {
        let attempt = envelope.attempt;
        match envelope.task {
            Task::StartJob { job_id } => {
                drop(permit);
                if let Err(err) = self.jobs.start(job_id).await {
                    warn!(target = "reviews.queue", job_id = %job_id, error = %err, "start task failed");
                }
            }
            Task::FetchItem { job_id, item_id } => {
                self.fetch_item(job_id, item_id, attempt, permit).await
            }
            Task::CheckCompletion { job_id } => {
                let _permit = permit;
                if let Err(err) = self.jobs.check_completion(job_id).await {
                    warn!(
                        target = "reviews.queue",
                        job_id = %job_id,
                        error = %err,
                        "completion check failed"
                    );
                }
            }
        }
    }

    async fn fetch_item(
        &self,
        job_id: Uuid,
        item_id: String,
        attempt: u32,
        permit: OwnedSemaphorePermit,
    ) {
        let outcome = self.fetcher.run(job_id, &item_id).await;
        drop(permit);
        if let Err(err) = outcome {
            match err.disposition() {
                Disposition::Requeue { delay } if attempt + 1 < self.config.max_attempts => {
                    let delay = delay.unwrap_or(self.config.retry_delay);
                    info!(
                        target = "reviews.queue",
                        job_id = %job_id,
                        item_id = %item_id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "requeueing item task"
                    );
                    self.requeue(
                        Envelope {
                            task: Task::FetchItem { job_id, item_id },
                            attempt: attempt + 1,
                        },
                        delay,
                    );
                    return;
                }
                Disposition::Requeue { .. } => {
                    let message = format!("gave up after {} attempts: {err}", attempt + 1);
                    if let Err(store_err) = self.fetcher.mark_failed(job_id, &item_id, &message).await {
                        warn!(
                            target = "reviews.queue",
                            job_id = %job_id,
                            item_id = %item_id,
                            error = %store_err,
                            "could not finalize exhausted item"
                        );
                    }
                }
                Disposition::Finalize => {}
            }
        }

        if let Err(err) = self.queue.enqueue(Task::CheckCompletion { job_id }).await {
            warn!(target = "reviews.queue", job_id = %job_id, error = %err, "could not enqueue completion check");
        }
    }

    fn requeue(&self, envelope: Envelope, delay: Duration) {
        let queue = self.queue.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            clock.sleep(delay).await;
            if let Err(err) = queue.send(envelope).await {
                warn!(target = "reviews.queue", error = %err, "dropped requeued task");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fetch::testing::Harness,
        remote::{RemoteError, testing::page},
    };

    fn service(h: &Harness) -> (Arc<JobService>, TaskQueue, TaskReceiver) {
        let (queue, receiver) = TaskQueue::channel(h.settings.queue.capacity);
        let jobs = Arc::new(JobService::new(
            h.repo.clone(),
            queue.clone(),
            h.clock.clone(),
            h.settings.idempotency_ttl,
        ));
        (jobs, queue, receiver)
    }

    fn request(items: &[&str]) -> SubmitRequest {
        SubmitRequest {
            seller_id: "A1".into(),
            marketplace_id: None,
            item_ids: items.iter().map(|id| id.to_string()).collect(),
            date_range: None,
            mode: JobMode::Full,
            requested_by: Some("tests".into()),
        }
    }

    async fn finish_item(h: &Harness, job_id: Uuid, item_id: &str, outcome: Result<u64, &str>) {
        let now = h.clock.now();
        h.repo
            .update_item(job_id, item_id, &mut |item: &mut ItemFetchResult| {
                item.completed_at = Some(now);
                match outcome {
                    Ok(reviews) => {
                        item.status = JobStatus::Success;
                        item.reviews_count = reviews;
                        item.processed_location = Some(format!("memory://{item_id}.json"));
                    }
                    Err(message) => {
                        item.status = JobStatus::Failed;
                        item.error_message = Some(message.to_string());
                    }
                }
            })
            .await
            .unwrap();
    }

    async fn wait_until_finished(jobs: &JobService, job_id: Uuid) -> FetchJob {
        for _ in 0..500 {
            let job = jobs.get(job_id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} did not finish");
    }

    #[tokio::test]
    async fn mixed_results_roll_up_to_partial_success() {
        let h = Harness::new(Vec::new()).await;
        let (jobs, _queue, _rx) = service(&h);
        let job = h.job(&["B1", "B2", "B3"], JobMode::Full).await;
        finish_item(&h, job.id, "B1", Ok(5)).await;
        finish_item(&h, job.id, "B2", Ok(7)).await;
        finish_item(&h, job.id, "B3", Err("upstream said no")).await;

        let done = jobs.check_completion(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::PartialSuccess);
        assert_eq!(done.total_reviews_fetched, 12);
        assert_eq!(done.completed_items, 2);
        assert_eq!(done.failed_items, 1);
        assert_eq!(done.processed_locations.len(), 2);
        assert_eq!(done.error_message.as_deref(), Some("upstream said no"));

        h.clock.advance(Duration::from_secs(120));
        let again = jobs.check_completion(job.id).await.unwrap();
        assert_eq!(again.status, JobStatus::PartialSuccess);
        assert_eq!(again.completed_at, done.completed_at);
        assert_eq!(again.duration_seconds, done.duration_seconds);
    }

    #[tokio::test]
    async fn unfinished_items_keep_job_in_progress() {
        let h = Harness::new(Vec::new()).await;
        let (jobs, _queue, _rx) = service(&h);
        let job = h.job(&["B1", "B2", "B3"], JobMode::Full).await;
        finish_item(&h, job.id, "B1", Ok(4)).await;
        finish_item(&h, job.id, "B2", Err("nope")).await;

        let pending = jobs.check_completion(job.id).await.unwrap();
        assert_eq!(pending.status, JobStatus::InProgress);
        assert_eq!(pending.completed_items, 1);
        assert_eq!(pending.failed_items, 1);
        assert!(pending.completed_at.is_none());
    }

    #[tokio::test]
    async fn all_or_nothing_outcomes() {
        let h = Harness::new(Vec::new()).await;
        let (jobs, _queue, _rx) = service(&h);

        let ok = h.job(&["B1", "B2"], JobMode::Full).await;
        finish_item(&h, ok.id, "B1", Ok(1)).await;
        finish_item(&h, ok.id, "B2", Ok(0)).await;
        let ok = jobs.check_completion(ok.id).await.unwrap();
        assert_eq!(ok.status, JobStatus::Success);
        assert!(ok.error_message.is_none());

        let bad = h.job(&["B1"], JobMode::Full).await;
        finish_item(&h, bad.id, "B1", Err("boom")).await;
        assert_eq!(
            jobs.check_completion(bad.id).await.unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn submit_validates_and_dedupes() {
        let h = Harness::new(Vec::new()).await;
        let (jobs, _queue, mut rx) = service(&h);

        assert!(matches!(
            jobs.submit(request(&[" ", ""]), None).await,
            Err(JobError::InvalidRequest(_))
        ));
        let too_many: Vec<String> = (0..=MAX_ITEMS_PER_JOB).map(|n| format!("B{n}")).collect();
        let mut oversized = request(&[]);
        oversized.item_ids = too_many;
        assert!(matches!(
            jobs.submit(oversized, None).await,
            Err(JobError::InvalidRequest(_))
        ));
        let mut unknown = request(&["B1"]);
        unknown.seller_id = "ghost".into();
        assert!(matches!(
            jobs.submit(unknown, None).await,
            Err(JobError::SellerNotFound(_))
        ));

        let submission = jobs
            .submit(request(&["B1", " B2 ", "B1"]), None)
            .await
            .unwrap();
        assert!(!submission.reused);
        assert_eq!(submission.job.item_ids, vec!["B1", "B2"]);
        assert_eq!(submission.job.status, JobStatus::Pending);
        assert_eq!(submission.job.marketplace_id, "ATVPDKIKX0DER");
        assert_eq!(
            rx.rx.try_recv().unwrap().task,
            Task::StartJob {
                job_id: submission.job.id
            }
        );
    }

    #[tokio::test]
    async fn inactive_seller_cannot_submit() {
        let h = Harness::new(Vec::new()).await;
        let (jobs, _queue, _rx) = service(&h);
        h.tokens.revoke("A1").await.unwrap();

        assert!(matches!(
            jobs.submit(request(&["B1"]), None).await,
            Err(JobError::SellerInactive {
                status: SellerStatus::Revoked,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn idempotency_key_replays_original_job() {
        let h = Harness::new(Vec::new()).await;
        let (jobs, _queue, _rx) = service(&h);

        let first = jobs.submit(request(&["B1"]), Some("req-1")).await.unwrap();
        let second = jobs.submit(request(&["B9"]), Some("req-1")).await.unwrap();
        assert!(second.reused);
        assert_eq!(second.job.id, first.job.id);
        assert_eq!(jobs.jobs_for_seller("A1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn idempotency_keys_do_not_cross_sellers() {
        let h = Harness::new(Vec::new()).await;
        let (jobs, _queue, _rx) = service(&h);
        let mut other = h.repo.get_seller("A1").await.unwrap().unwrap();
        other.id = "A2".into();
        h.repo.put_seller(other).await.unwrap();

        let first = jobs.submit(request(&["B1"]), Some("k")).await.unwrap();
        let mut for_other = request(&["B1"]);
        for_other.seller_id = "A2".into();
        let second = jobs.submit(for_other, Some("k")).await.unwrap();

        assert!(!second.reused);
        assert_eq!(second.job.seller_id, "A2");
        assert_ne!(second.job.id, first.job.id);
        assert_eq!(jobs.jobs_for_seller("A2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn expired_idempotency_key_starts_a_new_job() {
        let h = Harness::new(Vec::new()).await;
        let (jobs, _queue, _rx) = service(&h);

        let first = jobs.submit(request(&["B1"]), Some("req-1")).await.unwrap();
        h.clock
            .advance(h.settings.idempotency_ttl + Duration::from_secs(1));
        let second = jobs.submit(request(&["B1"]), Some("req-1")).await.unwrap();

        assert!(!second.reused);
        assert_ne!(second.job.id, first.job.id);
        let third = jobs.submit(request(&["B1"]), Some("req-1")).await.unwrap();
        assert!(third.reused);
        assert_eq!(third.job.id, second.job.id);
    }

    #[tokio::test]
    async fn cancel_only_applies_to_unfinished_jobs() {
        let h = Harness::new(Vec::new()).await;
        let (jobs, _queue, _rx) = service(&h);
        let job = jobs.submit(request(&["B1"]), None).await.unwrap().job;

        let cancelled = jobs.cancel(job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(matches!(jobs.cancel(job.id).await, Err(JobError::Conflict(_))));
        assert_eq!(
            jobs.check_completion(job.id).await.unwrap().status,
            JobStatus::Cancelled
        );
        assert!(matches!(
            jobs.cancel(Uuid::new_v4()).await,
            Err(JobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn worker_runs_job_to_completion_after_throttle() {
        let h = Harness::new(vec![
            Err(RemoteError::RateLimited {
                retry_after: Some(Duration::from_secs(2)),
            }),
            Ok(page(2, Some("c2"))),
            Ok(page(3, None)),
        ])
        .await;
        let (jobs, queue, receiver) = service(&h);
        let handle = Worker::new(
            jobs.clone(),
            h.fetcher.clone(),
            queue,
            h.clock.clone(),
            h.settings.queue,
        )
        .spawn(receiver);

        let job = jobs.submit(request(&["B1"]), None).await.unwrap().job;
        let done = wait_until_finished(&jobs, job.id).await;
        assert_eq!(done.status, JobStatus::Success);
        assert_eq!(done.total_reviews_fetched, 5);
        assert!(done.started_at.is_some());

        let items = jobs.items(job.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].retry_count, 1);
        assert_eq!(items[0].pages_fetched, 2);
        handle.abort();
    }

    #[tokio::test]
    async fn single_permit_and_tiny_queue_still_drain_a_wide_job() {
        let items = ["B1", "B2", "B3", "B4", "B5"];
        let h = Harness::new(items.iter().map(|_| Ok(page(1, None))).collect()).await;
        let (queue, receiver) = TaskQueue::channel(1);
        let jobs = Arc::new(JobService::new(
            h.repo.clone(),
            queue.clone(),
            h.clock.clone(),
            h.settings.idempotency_ttl,
        ));
        let config = QueueConfig {
            capacity: 1,
            concurrency: 1,
            ..h.settings.queue
        };
        let handle = Worker::new(jobs.clone(), h.fetcher.clone(), queue, h.clock.clone(), config)
            .spawn(receiver);

        let job = jobs.submit(request(&items), None).await.unwrap().job;
        let done = wait_until_finished(&jobs, job.id).await;
        assert_eq!(done.status, JobStatus::Success);
        assert_eq!(done.completed_items, items.len() as u32);
        assert_eq!(h.source.calls(), items.len());
        handle.abort();
    }

    #[tokio::test]
    async fn exhausted_requeues_fail_the_item() {
        let attempts = Harness::new(Vec::new()).await.settings.queue.max_attempts;
        let h = Harness::new(
            (0..attempts)
                .map(|_| Err(RemoteError::RateLimited { retry_after: None }))
                .collect(),
        )
        .await;
        let (jobs, queue, receiver) = service(&h);
        let handle = Worker::new(
            jobs.clone(),
            h.fetcher.clone(),
            queue,
            h.clock.clone(),
            h.settings.queue,
        )
        .spawn(receiver);

        let job = jobs.submit(request(&["B1"]), None).await.unwrap().job;
        let done = wait_until_finished(&jobs, job.id).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert_eq!(done.failed_items, 1);
        assert!(done.error_message.unwrap().contains("gave up after"));
        assert_eq!(h.source.calls(), attempts as usize);
        handle.abort();
    }
}
