//! The bus: a bounded queue feeding a fixed worker pool.
//!
//! Coordinators submit one [`ImageTask`] per image entry. The queue is
//! bounded, so submission applies backpressure instead of buffering without
//! limit — a coordinator extracting faster than the workers process simply
//! waits. Each worker records Processing in the ledger, invokes the
//! processor, and records the outcome; a failed attempt is retried in place
//! until the task's retry budget (`retry_max` retries after the initial
//! attempt) is spent.
//!
//! Every submission returns a completion channel; the coordinator's barrier
//! is just "await them all". Cancellation is cooperative: a worker finishes
//! the image it is holding, stops pulling, and leaves queued tasks to be
//! resumed from the ledger on the next run.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::error::BusError;
use crate::fingerprint::Fingerprint;
use crate::ledger::ImageStatus;
use crate::ledger::Ledger;
use crate::processor::ImageProcessor;
use crate::processor::ProcessorError;

/// One image entry to process, addressed by (fingerprint, entry).
#[derive(Debug, Clone)]
pub struct ImageTask {
    pub fingerprint: Fingerprint,
    /// Entry path inside the archive, `/`-separated.
    pub entry: String,
    /// Extracted input file under the scratch `in/` tree.
    pub input: PathBuf,
    /// Target file under the scratch `out/` tree.
    pub output: PathBuf,
    /// Retries already spent in a previous run (resume carries these over).
    pub retries_done: u32,
}

/// Terminal result for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub entry: String,
    pub status: ImageStatus,
    pub retries: u32,
}

/// What the coordinator awaits per task. `Err` carries only fatal ledger
/// failures; a merely failed image is an `Ok` outcome with status Failed.
pub type TaskCompletion = oneshot::Receiver<Result<TaskOutcome, BusError>>;

struct QueueItem {
    task: ImageTask,
    ledger: Arc<Ledger>,
    done: oneshot::Sender<Result<TaskOutcome, BusError>>,
}

pub struct Dispatcher {
    tx: async_channel::Sender<QueueItem>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(
        worker_count: usize,
        queue_capacity: usize,
        retry_max: u32,
        processor: Arc<dyn ImageProcessor>,
        cancel: CancellationToken,
    ) -> Dispatcher {
        let (tx, rx) = async_channel::bounded::<QueueItem>(queue_capacity);
        let workers = (0..worker_count)
            .map(|index| {
                let rx = rx.clone();
                let processor = Arc::clone(&processor);
                let cancel = cancel.clone();
                tokio::spawn(worker_loop(index, rx, processor, retry_max, cancel))
            })
            .collect();
        Dispatcher {
            tx,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueue a task, blocking while the queue is full. The returned
    /// channel resolves when the task reaches a terminal state; it errors
    /// only when the bus shut down before the task ran.
    pub async fn submit(&self, ledger: Arc<Ledger>, task: ImageTask) -> TaskCompletion {
        let (done, completion) = oneshot::channel();
        let item = QueueItem { task, ledger, done };
        // A closed channel drops the item, and with it the sender; the
        // caller then sees the completion channel fail, which reads as
        // "shut down before processing".
        let _ = self.tx.send(item).await;
        completion
    }

    /// Close the queue and wait for workers to drain what was accepted.
    /// Idempotent; later calls find nothing left to join.
    pub async fn shutdown(&self) {
        self.tx.close();
        let workers = std::mem::take(&mut *lock_or_recover(&self.workers));
        for worker in workers {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(
    index: usize,
    rx: async_channel::Receiver<QueueItem>,
    processor: Arc<dyn ImageProcessor>,
    retry_max: u32,
    cancel: CancellationToken,
) {
    debug!(worker = index, "image worker started");
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Ok(item) => item,
                Err(_) => break,
            },
        };
        let result = run_task(
            &item.task,
            &item.ledger,
            processor.as_ref(),
            retry_max,
            &cancel,
        )
        .await;
        if result.is_err() {
            // Progress can no longer be recorded; wind the whole bus down.
            cancel.cancel();
        }
        let _ = item.done.send(result);
    }
    // After cancellation, keep draining so queued tasks resolve as dropped
    // completions instead of leaving their submitters waiting. Dropping an
    // item never records anything, so the ledger still shows those entries
    // as outstanding work.
    if cancel.is_cancelled() {
        while let Ok(item) = rx.recv().await {
            drop(item);
        }
    }
    debug!(worker = index, "image worker stopped");
}

async fn run_task(
    task: &ImageTask,
    ledger: &Ledger,
    processor: &dyn ImageProcessor,
    retry_max: u32,
    cancel: &CancellationToken,
) -> Result<TaskOutcome, BusError> {
    let mut retries = task.retries_done;
    loop {
        ledger.record_image(&task.fingerprint, &task.entry, ImageStatus::Processing, retries)?;

        match attempt(processor, task).await {
            Ok(()) => {
                ledger.record_image(
                    &task.fingerprint,
                    &task.entry,
                    ImageStatus::Succeeded,
                    retries,
                )?;
                return Ok(TaskOutcome {
                    entry: task.entry.clone(),
                    status: ImageStatus::Succeeded,
                    retries,
                });
            }
            Err(err) => {
                // Whatever was partially written must not survive into the
                // next attempt or the repack.
                let _ = std::fs::remove_file(&task.output);

                if retries < retry_max && !cancel.is_cancelled() {
                    retries += 1;
                    warn!(
                        entry = %task.entry,
                        retries,
                        retry_max,
                        %err,
                        "image attempt failed, retrying"
                    );
                    tokio::time::sleep(retry_delay(retries)).await;
                    continue;
                }

                // Failed with retries left only happens on cancellation;
                // the recorded retry count stays below the budget, so the
                // next run resumes this entry.
                ledger.record_image(&task.fingerprint, &task.entry, ImageStatus::Failed, retries)?;
                warn!(entry = %task.entry, retries, %err, "image failed");
                return Ok(TaskOutcome {
                    entry: task.entry.clone(),
                    status: ImageStatus::Failed,
                    retries,
                });
            }
        }
    }
}

async fn attempt(processor: &dyn ImageProcessor, task: &ImageTask) -> Result<(), ProcessorError> {
    if let Some(parent) = task.output.parent() {
        std::fs::create_dir_all(parent).map_err(ProcessorError::Io)?;
    }
    processor.process(&task.input, &task.output).await
}

fn retry_delay(retries: u32) -> Duration {
    Duration::from_millis(100 * u64::from(retries.min(10)))
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::config::RootConfig;

    struct AlwaysFails {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ImageProcessor for AlwaysFails {
        async fn process(&self, _input: &Path, _output: &Path) -> Result<(), ProcessorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProcessorError::Failed {
                code: 1,
                stderr: "boom".to_string(),
            })
        }
    }

    struct CopiesBytes;

    #[async_trait]
    impl ImageProcessor for CopiesBytes {
        async fn process(&self, input: &Path, output: &Path) -> Result<(), ProcessorError> {
            tokio::fs::copy(input, output).await?;
            Ok(())
        }
    }

    struct Gated {
        gate: Arc<Semaphore>,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ImageProcessor for Gated {
        async fn process(&self, input: &Path, output: &Path) -> Result<(), ProcessorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.map_err(|_| ProcessorError::Failed {
                code: -1,
                stderr: "gate closed".to_string(),
            })?;
            tokio::fs::copy(input, output).await?;
            Ok(())
        }
    }

    struct Env {
        _dir: TempDir,
        ledger: Arc<Ledger>,
        scratch: std::path::PathBuf,
    }

    fn env() -> Env {
        let dir = TempDir::new().unwrap();
        let root = RootConfig::new(dir.path());
        let ledger = Arc::new(Ledger::open(&root).unwrap());
        let scratch = dir.path().join("scratch");
        std::fs::create_dir_all(scratch.join("in")).unwrap();
        std::fs::create_dir_all(scratch.join("out")).unwrap();
        Env {
            _dir: dir,
            ledger,
            scratch,
        }
    }

    fn fp(tag: &str) -> Fingerprint {
        Fingerprint::from_hex(format!("{tag:0>64}"))
    }

    fn task(env: &Env, tag: &str, entry: &str) -> ImageTask {
        let input = env.scratch.join("in").join(entry);
        std::fs::write(&input, entry.as_bytes()).unwrap();
        ImageTask {
            fingerprint: fp(tag),
            entry: entry.to_string(),
            input,
            output: env.scratch.join("out").join(entry),
            retries_done: 0,
        }
    }

    #[tokio::test]
    async fn an_always_failing_image_is_retried_exactly_retry_max_times() {
        let env = env();
        let calls = Arc::new(AtomicU32::new(0));
        let processor = Arc::new(AlwaysFails {
            calls: Arc::clone(&calls),
        });
        let dispatcher = Dispatcher::new(2, 8, 2, processor, CancellationToken::new());

        let completion = dispatcher
            .submit(Arc::clone(&env.ledger), task(&env, "a", "001.png"))
            .await;
        let outcome = completion.await.unwrap().unwrap();

        assert_eq!(outcome.status, ImageStatus::Failed);
        assert_eq!(outcome.retries, 2);
        // Initial attempt plus two retries.
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let states = env.ledger.load_all().unwrap();
        let image = states[&fp("a")].images["001.png"];
        assert_eq!(image.status, ImageStatus::Failed);
        assert_eq!(image.retries, 2);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn success_is_recorded_with_the_produced_output() {
        let env = env();
        let dispatcher = Dispatcher::new(2, 8, 2, Arc::new(CopiesBytes), CancellationToken::new());

        let completion = dispatcher
            .submit(Arc::clone(&env.ledger), task(&env, "b", "002.png"))
            .await;
        let outcome = completion.await.unwrap().unwrap();

        assert_eq!(outcome.status, ImageStatus::Succeeded);
        assert_eq!(outcome.retries, 0);
        assert_eq!(
            std::fs::read(env.scratch.join("out/002.png")).unwrap(),
            b"002.png"
        );

        let states = env.ledger.load_all().unwrap();
        assert_eq!(
            states[&fp("b")].images["002.png"].status,
            ImageStatus::Succeeded
        );
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn a_full_queue_applies_backpressure() {
        let env = env();
        let gate = Arc::new(Semaphore::new(0));
        let calls = Arc::new(AtomicU32::new(0));
        let processor = Arc::new(Gated {
            gate: Arc::clone(&gate),
            calls: Arc::clone(&calls),
        });
        // One worker, queue of one: the third submit must wait.
        let dispatcher = Dispatcher::new(1, 1, 0, processor, CancellationToken::new());

        let c1 = dispatcher
            .submit(Arc::clone(&env.ledger), task(&env, "c", "001.png"))
            .await;
        // Give the worker a beat to pull the first task off the queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let c2 = dispatcher
            .submit(Arc::clone(&env.ledger), task(&env, "c", "002.png"))
            .await;

        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            dispatcher.submit(Arc::clone(&env.ledger), task(&env, "c", "003.png")),
        )
        .await;
        assert!(blocked.is_err(), "third submit should block on a full queue");

        gate.add_permits(8);
        let c3 = dispatcher
            .submit(Arc::clone(&env.ledger), task(&env, "c", "003.png"))
            .await;
        for completion in [c1, c2, c3] {
            let outcome = completion.await.unwrap().unwrap();
            assert_eq!(outcome.status, ImageStatus::Succeeded);
        }
        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn cancellation_finishes_the_current_image_and_leaves_the_rest() {
        let env = env();
        let gate = Arc::new(Semaphore::new(0));
        let calls = Arc::new(AtomicU32::new(0));
        let processor = Arc::new(Gated {
            gate: Arc::clone(&gate),
            calls: Arc::clone(&calls),
        });
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(1, 4, 0, processor, cancel.clone());

        let c1 = dispatcher
            .submit(Arc::clone(&env.ledger), task(&env, "d", "001.png"))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let c2 = dispatcher
            .submit(Arc::clone(&env.ledger), task(&env, "d", "002.png"))
            .await;

        cancel.cancel();
        gate.add_permits(8);

        // The in-flight image completes.
        let outcome = c1.await.unwrap().unwrap();
        assert_eq!(outcome.status, ImageStatus::Succeeded);

        dispatcher.shutdown().await;
        // The queued image was never started and its channel is dropped.
        assert!(c2.await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The untouched entry has no record at all, so resume still sees
        // it as outstanding work rather than a failure.
        let states = env.ledger.load_all().unwrap();
        let state = &states[&fp("d")];
        assert_eq!(state.images["001.png"].status, ImageStatus::Succeeded);
        assert!(!state.images.contains_key("002.png"));
    }

    #[tokio::test]
    async fn carried_over_retries_shrink_the_remaining_budget() {
        let env = env();
        let calls = Arc::new(AtomicU32::new(0));
        let processor = Arc::new(AlwaysFails {
            calls: Arc::clone(&calls),
        });
        let dispatcher = Dispatcher::new(1, 4, 3, processor, CancellationToken::new());

        let mut resumed = task(&env, "e", "001.png");
        resumed.retries_done = 2;
        let completion = dispatcher.submit(Arc::clone(&env.ledger), resumed).await;
        let outcome = completion.await.unwrap().unwrap();

        assert_eq!(outcome.status, ImageStatus::Failed);
        assert_eq!(outcome.retries, 3);
        // Attempt at retries=2 plus the final attempt at retries=3.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        dispatcher.shutdown().await;
    }
}
