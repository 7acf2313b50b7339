//! Provides the bounded worker pool executing refresh jobs.
//!
//! The pool consists of a fixed set of workers, a bounded **submission** channel and a
//! **rendezvous** channel: whenever a worker runs out of work, it publishes its personal
//! single-slot inbox on the rendezvous channel and then waits on that inbox. A single dispatcher
//! task pairs things up - it takes one job from the submission channel, one idle inbox from the
//! rendezvous channel and forwards the job. This keeps job hand-off roughly fair among workers
//! while preserving the property we actually care about: once `queue_size` jobs are outstanding,
//! [submit](JobQueue::submit) waits until a worker catches up. Overload therefore queues refresh
//! work instead of spawning an unbounded number of tasks.
//!
//! Jobs are executed in no particular order relative to each other.
use crate::metrics::CacheMetrics;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A unit of work executed by the pool.
///
/// Jobs are parameterless - everything they operate on (key, deadline, engine handle, ...) is
/// captured when the job is created.
pub type Job = BoxFuture<'static, ()>;

/// A clonable handle used to push jobs into the pool.
#[derive(Clone)]
pub struct JobQueue {
    jobs: mpsc::Sender<Job>,
}

impl JobQueue {
    /// Hands the given job to the pool.
    ///
    /// If `queue_size` jobs are already outstanding, this waits until a slot frees up - callers
    /// which must not block therefore submit from a background task.
    pub async fn submit(&self, job: Job) {
        if self.jobs.send(job).await.is_err() {
            log::warn!("Dropping a job as the worker pool has shut down.");
        }
    }
}

/// A fixed set of workers draining a bounded job queue.
///
/// The pool starts its workers and its dispatcher immediately upon construction and runs until
/// either [stop](WorkerPool::stop) is invoked or the pool (together with all outstanding
/// [JobQueue](JobQueue) handles) is dropped. In the latter case the dispatcher drains the jobs
/// which were already submitted and then winds everything down.
pub struct WorkerPool {
    queue: JobQueue,
    quits: Vec<mpsc::Sender<()>>,
}

impl WorkerPool {
    /// Launches a pool of `workers` workers behind a submission queue of `queue_size` slots.
    ///
    /// Each executed job bumps the processed counter of its worker in the given metrics. Both
    /// sizes are clamped to at least one.
    pub fn new(queue_size: usize, workers: usize, metrics: Arc<CacheMetrics>) -> Self {
        let workers = workers.max(1);
        let (jobs, job_receiver) = mpsc::channel::<Job>(queue_size.max(1));
        let (ready, idle_workers) = mpsc::channel::<mpsc::Sender<Job>>(workers);

        let mut quits = Vec::with_capacity(workers);
        for id in 0..workers {
            let (quit, quit_receiver) = mpsc::channel::<()>(1);
            quits.push(quit);
            start_worker(id, ready.clone(), quit_receiver, metrics.clone());
        }

        start_dispatcher(job_receiver, idle_workers);

        WorkerPool {
            queue: JobQueue { jobs },
            quits,
        }
    }

    /// Returns a handle for submitting jobs.
    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    /// Signals all workers to exit once they finished their current job.
    ///
    /// Jobs still sitting in the queue are not executed anymore. Invoking this more than once
    /// is harmless.
    pub fn stop(&self) {
        for quit in &self.quits {
            let _ = quit.try_send(());
        }
    }
}

/// Spawns a worker task.
///
/// The worker advertises its idleness by publishing its inbox, then waits for either a job or
/// its quit signal. It also exits once the rendezvous channel is gone, which happens when the
/// pool and its dispatcher have been dropped.
fn start_worker(
    id: usize,
    ready: mpsc::Sender<mpsc::Sender<Job>>,
    mut quit: mpsc::Receiver<()>,
    metrics: Arc<CacheMetrics>,
) {
    crate::spawn!(async move {
        let (inbox, mut assigned_jobs) = mpsc::channel::<Job>(1);

        loop {
            if ready.send(inbox.clone()).await.is_err() {
                return;
            }

            tokio::select! {
                job = assigned_jobs.recv() => {
                    if let Some(job) = job {
                        job.await;
                        metrics.record_processed(id);
                    }
                }
                _ = quit.recv() => {
                    log::debug!("Worker {} is shutting down...", id);
                    return;
                }
            }
        }
    });
}

/// Spawns the dispatcher task pairing submitted jobs with idle workers.
///
/// The dispatcher is strictly sequential and holds at most one job in hand, so the number of
/// outstanding jobs stays bounded by the queue size plus the workers' inboxes.
fn start_dispatcher(
    mut jobs: mpsc::Receiver<Job>,
    mut idle_workers: mpsc::Receiver<mpsc::Sender<Job>>,
) {
    crate::spawn!(async move {
        while let Some(job) = jobs.recv().await {
            match idle_workers.recv().await {
                Some(inbox) => {
                    if inbox.send(job).await.is_err() {
                        log::warn!("Dropping a job as its assigned worker has shut down.");
                    }
                }
                None => {
                    log::debug!("All workers are gone. Shutting down the dispatcher...");
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::WorkerPool;
    use crate::metrics::CacheMetrics;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    async fn await_counter(counter: &Arc<AtomicUsize>, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        panic!(
            "counter settled at {} instead of {}",
            counter.load(Ordering::SeqCst),
            expected
        );
    }

    #[tokio::test]
    async fn every_submitted_job_is_executed_exactly_once() {
        let metrics = Arc::new(CacheMetrics::new(3));
        let pool = WorkerPool::new(4, 3, metrics.clone());
        let queue = pool.queue();
        let executions = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let executions = executions.clone();
            queue
                .submit(Box::pin(async move {
                    let _ = executions.fetch_add(1, Ordering::SeqCst);
                }))
                .await;
        }

        await_counter(&executions, 10).await;
        assert_eq!(metrics.processed_total(), 10);
    }

    #[tokio::test]
    async fn full_queue_blocks_further_submissions() {
        let metrics = Arc::new(CacheMetrics::new(1));
        let pool = WorkerPool::new(1, 1, metrics.clone());
        let queue = pool.queue();
        let executions = Arc::new(AtomicUsize::new(0));

        // With one queue slot, one worker and one job in the dispatcher's hand, the fourth
        // submission has to wait for the first job to complete...
        let start = Instant::now();
        for _ in 0..4 {
            let executions = executions.clone();
            queue
                .submit(Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    let _ = executions.fetch_add(1, Ordering::SeqCst);
                }))
                .await;
        }
        assert!(
            start.elapsed() >= Duration::from_millis(80),
            "submissions completed without ever experiencing backpressure"
        );

        await_counter(&executions, 4).await;
        assert_eq!(metrics.processed_total(), 4);
    }

    #[tokio::test]
    async fn stopped_workers_no_longer_pick_up_jobs() {
        let metrics = Arc::new(CacheMetrics::new(2));
        let pool = WorkerPool::new(2, 2, metrics.clone());
        let queue = pool.queue();

        pool.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;

        queue.submit(Box::pin(async move {})).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(metrics.processed_total(), 0);
    }
}
