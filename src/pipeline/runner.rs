//! Producer/consumer pipeline over a pool of fetch and analysis workers.
//!
//! Fetch workers call the injected fetcher under a shared concurrency
//! semaphore and the provider rate limiter; analysis workers run the
//! injected evaluator and write outcomes back through the shared caches.
//! Both pools poll their queue with a short timeout so cancellation is
//! observed within the poll interval, and both terminate on one shutdown
//! sentinel per worker.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::pipeline::hooks::{Evaluator, FetchError, Fetcher};
use crate::queue::{MpscWorkQueue, WorkQueue};
use crate::session::SessionGate;
use crate::storage::Caches;
use crate::throttle::RateLimiter;

/// Cache key under which the last fully processed subject is recorded.
pub const CHECKPOINT_KEY: &str = "lastSubject";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub fetch_workers: usize,
    pub analysis_workers: usize,
    /// Bound on simultaneous outbound calls, independent of worker count.
    pub fetch_concurrency: usize,
    /// Queue poll timeout; also the cancellation latency bound.
    pub poll_interval: Duration,
    /// Record the checkpoint every N handled subjects.
    pub checkpoint_every: usize,
    /// How long to wait for a worker to exit before abandoning it.
    pub join_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            fetch_workers: 4,
            analysis_workers: 4,
            fetch_concurrency: 4,
            poll_interval: Duration::from_millis(500),
            checkpoint_every: 5,
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// Accounting for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub total_subjects: usize,
    /// Subjects dropped by the cache pre-checks before enqueueing.
    pub skipped: usize,
    pub enqueued: usize,
    pub analyzed: usize,
    pub failed: usize,
    pub cancelled: bool,
}

enum FetchItem {
    Subject(String),
    Shutdown,
}

enum AnalysisItem {
    Fetched { subject: String, payload: Value },
    Failed { subject: String, reason: String },
    Shutdown,
}

struct Shared {
    config: PipelineConfig,
    fetch_queue: MpscWorkQueue<FetchItem>,
    analysis_queue: MpscWorkQueue<AnalysisItem>,
    semaphore: Semaphore,
    fetcher: Arc<dyn Fetcher>,
    evaluator: Arc<dyn Evaluator>,
    caches: Caches,
    limiter: RateLimiter,
    session: SessionGate,
    cancel: CancellationToken,
    /// Subjects enqueued but not yet terminally fetched.
    fetch_outstanding: AtomicUsize,
    /// Items pushed downstream but not yet handled by an analysis worker.
    analysis_outstanding: AtomicUsize,
    handled: AtomicUsize,
    analyzed: AtomicUsize,
    failed: AtomicUsize,
}

/// One run of the fetch/analyze pipeline over a bounded subject set.
pub struct SubjectPipeline {
    config: PipelineConfig,
    caches: Caches,
    limiter: RateLimiter,
    session: SessionGate,
    fetcher: Arc<dyn Fetcher>,
    evaluator: Arc<dyn Evaluator>,
}

impl SubjectPipeline {
    pub fn new(
        config: PipelineConfig,
        caches: Caches,
        limiter: RateLimiter,
        session: SessionGate,
        fetcher: Arc<dyn Fetcher>,
        evaluator: Arc<dyn Evaluator>,
    ) -> Self {
        Self {
            config,
            caches,
            limiter,
            session,
            fetcher,
            evaluator,
        }
    }

    /// Run the pipeline to completion or cancellation.
    ///
    /// Resumes after the checkpointed subject of a previous interrupted run,
    /// pre-filters subjects already present in the ignore/evaluated caches,
    /// and flushes the checkpoint cache before returning so a later run can
    /// pick up mid-list.
    pub async fn run(&self, subjects: Vec<String>, cancel: CancellationToken) -> PipelineReport {
        let run_id = Uuid::new_v4();
        let total_subjects = subjects.len();

        let last_seen = self
            .caches
            .checkpoint
            .get(CHECKPOINT_KEY)
            .and_then(|v| v.as_str().map(str::to_string));
        let start = resume_start(&subjects, last_seen.as_deref());

        let pending: Vec<String> = subjects[start..]
            .iter()
            .filter(|subject| {
                !self.caches.ignore.is_cached(subject) && !self.caches.evaluated.is_cached(subject)
            })
            .cloned()
            .collect();
        let skipped = (total_subjects - start) - pending.len();
        let enqueued = pending.len();

        info!(
            run_id = %run_id,
            total = total_subjects,
            resume_at = start,
            skipped,
            enqueued,
            "Pipeline run starting"
        );

        if pending.is_empty() {
            return PipelineReport {
                run_id,
                total_subjects,
                skipped,
                enqueued,
                analyzed: 0,
                failed: 0,
                cancelled: cancel.is_cancelled(),
            };
        }

        let capacity = enqueued + self.config.fetch_workers + self.config.analysis_workers + 1;
        let shared = Arc::new(Shared {
            config: self.config.clone(),
            fetch_queue: MpscWorkQueue::new(capacity),
            analysis_queue: MpscWorkQueue::new(capacity),
            semaphore: Semaphore::new(self.config.fetch_concurrency.max(1)),
            fetcher: self.fetcher.clone(),
            evaluator: self.evaluator.clone(),
            caches: self.caches.clone(),
            limiter: self.limiter.clone(),
            session: self.session.clone(),
            cancel: cancel.clone(),
            fetch_outstanding: AtomicUsize::new(enqueued),
            analysis_outstanding: AtomicUsize::new(0),
            handled: AtomicUsize::new(0),
            analyzed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        });

        for subject in pending {
            if let Err(err) = shared.fetch_queue.push(FetchItem::Subject(subject)).await {
                error!(run_id = %run_id, error = %err, "Failed to enqueue subject");
                shared.fetch_outstanding.fetch_sub(1, Ordering::SeqCst);
            }
        }

        let mut handles: Vec<(String, JoinHandle<()>)> = Vec::new();
        for i in 0..self.config.fetch_workers {
            let shared = shared.clone();
            handles.push((
                format!("fetch-{i}"),
                tokio::spawn(async move { fetch_worker(shared, i).await }),
            ));
        }
        for i in 0..self.config.analysis_workers {
            let shared = shared.clone();
            handles.push((
                format!("analysis-{i}"),
                tokio::spawn(async move { analysis_worker(shared, i).await }),
            ));
        }

        // Monitor until every subject has been fetched and analyzed, or a
        // cancellation fires.
        loop {
            if shared.cancel.is_cancelled() {
                break;
            }
            if shared.fetch_outstanding.load(Ordering::SeqCst) == 0
                && shared.analysis_outstanding.load(Ordering::SeqCst) == 0
            {
                break;
            }
            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                () = shared.cancel.cancelled() => break,
            }
        }

        // One terminal sentinel per worker so every consumer observes
        // termination even when the cancellation race already emptied a pool.
        for _ in 0..self.config.fetch_workers {
            let _ = shared.fetch_queue.try_push(FetchItem::Shutdown).await;
        }
        for _ in 0..self.config.analysis_workers {
            let _ = shared.analysis_queue.try_push(AnalysisItem::Shutdown).await;
        }

        for (worker, handle) in handles {
            match tokio::time::timeout(self.config.join_timeout, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(run_id = %run_id, worker, error = %err, "Worker panicked"),
                Err(_) => {
                    warn!(run_id = %run_id, worker, "Worker did not exit in time, abandoning")
                }
            }
        }

        // Flush position tracking even on early termination so a subsequent
        // run can resume mid-list.
        if let Err(err) = self.caches.checkpoint.save().await {
            warn!(run_id = %run_id, error = %err, "Checkpoint flush failed");
        }

        let report = PipelineReport {
            run_id,
            total_subjects,
            skipped,
            enqueued,
            analyzed: shared.analyzed.load(Ordering::SeqCst),
            failed: shared.failed.load(Ordering::SeqCst),
            cancelled: shared.cancel.is_cancelled(),
        };
        info!(
            run_id = %run_id,
            analyzed = report.analyzed,
            failed = report.failed,
            cancelled = report.cancelled,
            "Pipeline run finished"
        );
        report
    }
}

/// Index of the first subject to process given the recorded checkpoint.
fn resume_start(subjects: &[String], last_seen: Option<&str>) -> usize {
    let last_seen = match last_seen {
        Some(last_seen) => last_seen,
        None => return 0,
    };
    match subjects.iter().position(|s| s == last_seen) {
        Some(index) if index + 1 < subjects.len() => index + 1,
        _ => 0,
    }
}

async fn fetch_worker(shared: Arc<Shared>, index: usize) {
    debug!(worker = index, "Fetch worker started");
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }

        let subject = match shared
            .fetch_queue
            .pull_timeout(shared.config.poll_interval)
            .await
        {
            None => continue,
            Some(FetchItem::Shutdown) => break,
            Some(FetchItem::Subject(subject)) => subject,
        };

        let provider = shared.fetcher.provider().to_string();
        if shared.limiter.is_limited(&provider)
            && !shared.limiter.wait_until_clear(&provider, &shared.cancel).await
        {
            // Cancelled while parked; the subject stays outstanding so the
            // checkpoint never claims it was processed.
            let _ = shared.fetch_queue.try_push(FetchItem::Subject(subject)).await;
            break;
        }

        let outcome = {
            let permit = match shared.semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let outcome = shared.fetcher.fetch(&subject).await;
            drop(permit);
            outcome
        };

        match outcome {
            Ok(payload) => {
                shared.analysis_outstanding.fetch_add(1, Ordering::SeqCst);
                if let Err(err) = shared
                    .analysis_queue
                    .push(AnalysisItem::Fetched {
                        subject: subject.clone(),
                        payload,
                    })
                    .await
                {
                    error!(subject = %subject, error = %err, "Failed to hand off fetched payload");
                    shared.analysis_outstanding.fetch_sub(1, Ordering::SeqCst);
                    shared.failed.fetch_add(1, Ordering::SeqCst);
                }
                shared.fetch_outstanding.fetch_sub(1, Ordering::SeqCst);
            }
            Err(FetchError::RateLimited {
                provider,
                reset_seconds,
            }) => {
                warn!(subject = %subject, provider = %provider, reset_seconds, "Fetch hit a rate limit, requeueing");
                shared.limiter.mark_limited(&provider, reset_seconds);
                if shared
                    .fetch_queue
                    .try_push(FetchItem::Subject(subject.clone()))
                    .await
                    .is_err()
                {
                    error!(subject = %subject, "Failed to requeue rate-limited subject");
                    shared.fetch_outstanding.fetch_sub(1, Ordering::SeqCst);
                    shared.failed.fetch_add(1, Ordering::SeqCst);
                }
            }
            Err(FetchError::SessionExpired { .. }) => {
                warn!(subject = %subject, "Session expired, pausing fetch worker");
                shared.session.mark_invalid();
                let restored = shared.session.wait_until_valid(&shared.cancel).await;
                let _ = shared
                    .fetch_queue
                    .try_push(FetchItem::Subject(subject.clone()))
                    .await;
                if !restored {
                    break;
                }
                debug!(subject = %subject, "Session restored, resuming fetch worker");
            }
            Err(FetchError::Failed { details, .. }) => {
                shared.analysis_outstanding.fetch_add(1, Ordering::SeqCst);
                if let Err(err) = shared
                    .analysis_queue
                    .push(AnalysisItem::Failed {
                        subject: subject.clone(),
                        reason: details,
                    })
                    .await
                {
                    error!(subject = %subject, error = %err, "Failed to hand off failure marker");
                    shared.analysis_outstanding.fetch_sub(1, Ordering::SeqCst);
                    shared.failed.fetch_add(1, Ordering::SeqCst);
                }
                shared.fetch_outstanding.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
    debug!(worker = index, "Fetch worker exiting");
}

async fn analysis_worker(shared: Arc<Shared>, index: usize) {
    debug!(worker = index, "Analysis worker started");
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }

        let item = match shared
            .analysis_queue
            .pull_timeout(shared.config.poll_interval)
            .await
        {
            None => continue,
            Some(AnalysisItem::Shutdown) => break,
            Some(item) => item,
        };

        match item {
            AnalysisItem::Failed { subject, reason } => {
                shared.caches.ignore.add(&subject, json!(reason));
                shared.failed.fetch_add(1, Ordering::SeqCst);
                finish_item(&shared, &subject);
            }
            AnalysisItem::Fetched { subject, payload } => {
                match shared.evaluator.evaluate(&subject, &payload).await {
                    Ok(evaluation) => match serde_json::to_value(&evaluation) {
                        Ok(outcome) => {
                            shared.caches.evaluated.add(&subject, outcome);
                            shared.analyzed.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(err) => {
                            error!(subject = %subject, error = %err, "Failed to serialize evaluation");
                            shared.failed.fetch_add(1, Ordering::SeqCst);
                        }
                    },
                    Err(err) => {
                        error!(subject = %subject, error = %err, "Evaluation failed");
                        shared.failed.fetch_add(1, Ordering::SeqCst);
                    }
                }
                finish_item(&shared, &subject);
            }
            AnalysisItem::Shutdown => break,
        }
    }
    debug!(worker = index, "Analysis worker exiting");
}

/// Record completion of one subject: checkpoint on the configured stride and
/// release the outstanding-item slot.
fn finish_item(shared: &Shared, subject: &str) {
    let handled = shared.handled.fetch_add(1, Ordering::SeqCst) + 1;
    if handled % shared.config.checkpoint_every.max(1) == 0 {
        shared.caches.checkpoint.add(CHECKPOINT_KEY, json!(subject));
    }
    shared.analysis_outstanding.fetch_sub(1, Ordering::SeqCst);
}
