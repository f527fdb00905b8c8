use crate::{
    adagrad::SparseAdagrad, cross_rel::CrossRelPartition, device::Device, table::EmbeddingTable,
};
use anyhow::{anyhow, Result};
use ndarray::Array2;
use parking_lot::Mutex;
use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    cell::RefCell,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{self, Receiver, Sender, SyncSender},
        Arc, Once,
    },
    thread::{self, JoinHandle},
};
use tracing::{debug, error, info};

/// A producer blocks in `submit` until the worker has taken the previous job.
pub const QUEUE_CAPACITY: usize = 1;

fn job_queue() -> (SyncSender<UpdateJob>, Receiver<UpdateJob>) {
    mpsc::sync_channel(QUEUE_CAPACITY)
}

pub enum UpdateJob {
    Apply {
        indices: Vec<usize>,
        grads: Array2<f32>,
        device: Device,
    },
    /// Sentinel: the worker exits after draining everything before it.
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerFailure {
    pub message: String,
    pub backtrace: Option<String>,
}

impl WorkerFailure {
    fn from_error(err: &anyhow::Error) -> Self {
        let backtrace = err.backtrace();
        Self {
            message: format!("{:#}", err),
            backtrace: match backtrace.status() {
                BacktraceStatus::Captured => Some(backtrace.to_string()),
                _ => None,
            },
        }
    }

    fn from_panic(payload: Box<dyn Any + Send>, report: Option<PanicReport>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        match report {
            Some(PanicReport {
                location: Some(location),
                backtrace,
            }) => Self {
                message: format!("panicked at {}: {}", location, message),
                backtrace: Some(backtrace),
            },
            Some(PanicReport {
                location: None,
                backtrace,
            }) => Self {
                message: format!("panicked: {}", message),
                backtrace: Some(backtrace),
            },
            None => Self {
                message: format!("panicked: {}", message),
                backtrace: None,
            },
        }
    }
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(backtrace) = &self.backtrace {
            write!(f, "\n\nworker backtrace:\n{}", backtrace)?;
        }
        Ok(())
    }
}

impl std::error::Error for WorkerFailure {}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Finished { jobs_applied: u64 },
    Failed(WorkerFailure),
}

struct PanicReport {
    location: Option<String>,
    backtrace: String,
}

type PanicSlot = Arc<Mutex<Option<PanicReport>>>;

thread_local! {
    static PANIC_SLOT: RefCell<Option<PanicSlot>> = RefCell::new(None);
}

static PANIC_HOOK: Once = Once::new();

// Threads attached to a slot record the first panic's location and backtrace
// while the panicking frame is still on the stack, then defer to the
// previously installed hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let slot = PANIC_SLOT
                .try_with(|s| s.try_borrow().ok().and_then(|s| s.clone()))
                .ok()
                .flatten();
            if let Some(slot) = slot {
                let mut report = slot.lock();
                if report.is_none() {
                    *report = Some(PanicReport {
                        location: info.location().map(|l| l.to_string()),
                        backtrace: Backtrace::force_capture().to_string(),
                    });
                }
            }
            previous(info);
        }));
    });
}

#[derive(Clone)]
struct PanicCapture {
    slot: PanicSlot,
}

impl PanicCapture {
    fn new() -> Self {
        install_panic_hook();
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Routes panics on the current thread into this capture.
    fn attach(&self) {
        PANIC_SLOT.with(|s| *s.borrow_mut() = Some(self.slot.clone()));
    }

    fn run<R>(&self, f: impl FnOnce() -> R) -> Result<R, WorkerFailure> {
        *self.slot.lock() = None;
        panic::catch_unwind(AssertUnwindSafe(f))
            .map_err(|payload| WorkerFailure::from_panic(payload, self.slot.lock().take()))
    }
}

#[derive(Clone)]
pub struct UpdateContext {
    pub table: Arc<EmbeddingTable>,
    pub partition: Option<Arc<CrossRelPartition>>,
    pub optimizer: SparseAdagrad,
}

impl UpdateContext {
    pub fn apply(&self, indices: &[usize], grads: &Array2<f32>) -> Result<()> {
        self.optimizer.apply(
            &self.table,
            self.partition.as_deref(),
            indices,
            grads.view(),
        )
    }
}

struct WorkerHandle {
    outcome: Receiver<WorkerOutcome>,
    thread: JoinHandle<()>,
}

/// Only the updater that spawned the worker can shut it down.
pub struct AsyncUpdater {
    jobs: SyncSender<UpdateJob>,
    worker: Option<WorkerHandle>,
}

impl AsyncUpdater {
    pub fn spawn(context: UpdateContext, num_thread: usize) -> Result<Self> {
        if num_thread == 0 {
            return Err(anyhow!("num_thread must be at least 1"));
        }
        let capture = PanicCapture::new();
        let pool_capture = capture.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_thread)
            .thread_name(|i| format!("kge-update-pool-{}", i))
            .start_handler(move |_| pool_capture.attach())
            .build()
            .map_err(|e| anyhow!("Failed to build update thread pool: {}", e))?;
        let (jobs_tx, jobs_rx) = job_queue();
        let (outcome_tx, outcome_rx) = mpsc::channel::<WorkerOutcome>();

        let thread = thread::Builder::new()
            .name("kge-async-update".to_string())
            .spawn(move || {
                capture.attach();
                run_worker(context, pool, capture, jobs_rx, outcome_tx)
            })
            .map_err(|e| anyhow!("Failed to spawn async update worker: {}", e))?;
        info!(num_thread, "async update worker started");

        Ok(Self {
            jobs: jobs_tx,
            worker: Some(WorkerHandle {
                outcome: outcome_rx,
                thread,
            }),
        })
    }

    pub fn producer(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
            worker: None,
        }
    }

    pub fn owns_worker(&self) -> bool {
        self.worker.is_some()
    }

    /// Blocks while the queue is full. Fails if the worker has stopped,
    /// carrying the worker's own failure when this end owns it.
    pub fn submit(&mut self, indices: Vec<usize>, grads: Array2<f32>, device: Device) -> Result<()> {
        let job = UpdateJob::Apply {
            indices,
            grads,
            device,
        };
        if self.jobs.send(job).is_ok() {
            return Ok(());
        }
        match self.worker.take() {
            Some(worker) => match worker.join()? {
                WorkerOutcome::Failed(failure) => {
                    Err(anyhow::Error::new(failure).context("async update worker failed"))
                }
                WorkerOutcome::Finished { .. } => Err(anyhow!("async update worker has stopped")),
            },
            None => Err(anyhow!("async update worker has stopped")),
        }
    }

    /// Sends the sentinel and waits for every queued job to be applied.
    /// Returns the number of jobs the worker applied over its lifetime.
    pub fn finish(&mut self) -> Result<u64> {
        let worker = self
            .worker
            .take()
            .ok_or_else(|| anyhow!("this updater does not own the async update worker"))?;
        // A failed worker has already hung up; its outcome is still waiting.
        let _ = self.jobs.send(UpdateJob::Stop);
        match worker.join()? {
            WorkerOutcome::Finished { jobs_applied } => {
                info!(jobs_applied, "async update worker finished");
                Ok(jobs_applied)
            }
            WorkerOutcome::Failed(failure) => {
                Err(anyhow::Error::new(failure).context("async update worker failed"))
            }
        }
    }
}

impl Drop for AsyncUpdater {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.finish() {
                error!("async update worker did not shut down cleanly: {:#}", e);
            }
        }
    }
}

impl WorkerHandle {
    fn join(self) -> Result<WorkerOutcome> {
        let outcome = self.outcome.recv();
        self.thread
            .join()
            .map_err(|_| anyhow!("async update worker thread panicked outside a job"))?;
        outcome.map_err(|_| anyhow!("async update worker exited without reporting an outcome"))
    }
}

fn run_worker(
    context: UpdateContext,
    pool: rayon::ThreadPool,
    capture: PanicCapture,
    jobs: Receiver<UpdateJob>,
    outcome: Sender<WorkerOutcome>,
) {
    let mut jobs_applied = 0u64;
    let result = loop {
        let (indices, grads, device) = match jobs.recv() {
            Ok(UpdateJob::Apply {
                indices,
                grads,
                device,
            }) => (indices, grads, device),
            // Every producer gone counts as a stop.
            Ok(UpdateJob::Stop) | Err(_) => break Ok(()),
        };
        match capture.run(|| pool.install(|| context.apply(&indices, &grads))) {
            Ok(Ok(())) => {
                jobs_applied += 1;
                debug!(rows = indices.len(), %device, jobs_applied, "applied update job");
            }
            Ok(Err(e)) => break Err(WorkerFailure::from_error(&e)),
            Err(failure) => break Err(failure),
        }
    };
    let report = match result {
        Ok(()) => WorkerOutcome::Finished { jobs_applied },
        Err(failure) => {
            error!("async update worker failed: {}", failure.message);
            WorkerOutcome::Failed(failure)
        }
    };
    let _ = outcome.send(report);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc::TrySendError,
        },
        time::Duration,
    };

    #[test]
    fn test_job_queue_holds_one_job() {
        let (tx, rx) = job_queue();
        assert!(tx.try_send(UpdateJob::Stop).is_ok());
        assert!(matches!(
            tx.try_send(UpdateJob::Stop),
            Err(TrySendError::Full(_))
        ));
        assert!(matches!(rx.recv(), Ok(UpdateJob::Stop)));
        assert!(tx.try_send(UpdateJob::Stop).is_ok());
    }

    #[test]
    fn test_full_queue_blocks_producer_until_drained() {
        let (tx, rx) = job_queue();
        tx.send(UpdateJob::Stop).unwrap();

        let sent = Arc::new(AtomicBool::new(false));
        let producer = {
            let sent = sent.clone();
            thread::spawn(move || {
                tx.send(UpdateJob::Stop).unwrap();
                sent.store(true, Ordering::SeqCst);
            })
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!sent.load(Ordering::SeqCst));

        rx.recv().unwrap();
        producer.join().unwrap();
        assert!(sent.load(Ordering::SeqCst));
        assert!(rx.recv().is_ok());
    }

    #[test]
    fn test_panic_reports_origin() {
        let capture = PanicCapture::new();
        let pool_capture = capture.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .start_handler(move |_| pool_capture.attach())
            .build()
            .unwrap();

        let failure = capture
            .run(|| pool.install(|| -> () { panic!("row kernel failed") }))
            .unwrap_err();
        assert!(failure.message.contains("row kernel failed"), "{}", failure.message);
        assert!(failure.message.contains("async_update.rs"), "{}", failure.message);
        assert!(failure.backtrace.is_some());

        assert_eq!(capture.run(|| 7).unwrap(), 7);
    }
}
