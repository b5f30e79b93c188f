//! Background unit of work with a cancellable lifecycle.
//!
//! A [`BackgroundTask`] wraps one async job (the receive loop of a
//! connection) and runs it as a Tokio task on the runtime that was current
//! when the task was created:
//!
//! ```text
//! NotStarted ──start()──▶ Running ──stop_and_wait()──▶ StopRequested ──▶ Stopped
//!                            │
//!                            └── job returns an error ──▶ Failed(error)
//! ```
//!
//! The job receives a [`CancellationToken`] and is expected to watch it at
//! every await point. A job that ends because of cancellation is `Stopped`,
//! never `Failed`. Failure listeners are called exactly once each.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{LifecycleError, RfbError};

type Job = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), RfbError>> + Send>;
type FailureListener = Box<dyn FnOnce(Arc<RfbError>) + Send + 'static>;

// ── ThreadState ──────────────────────────────────────────────────

/// Lifecycle of a [`BackgroundTask`].
#[derive(Debug, Clone)]
pub enum ThreadState {
    NotStarted,
    Running,
    StopRequested,
    Stopped,
    Failed(Arc<RfbError>),
}

impl ThreadState {
    /// Whether the job has exited (or will never run).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ThreadState::Stopped | ThreadState::Failed(_))
    }
}

impl fmt::Display for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadState::NotStarted => write!(f, "NotStarted"),
            ThreadState::Running => write!(f, "Running"),
            ThreadState::StopRequested => write!(f, "StopRequested"),
            ThreadState::Stopped => write!(f, "Stopped"),
            ThreadState::Failed(e) => write!(f, "Failed({e})"),
        }
    }
}

// ── BackgroundTask ───────────────────────────────────────────────

struct Inner {
    state: ThreadState,
    job: Option<Job>,
    listeners: Vec<FailureListener>,
    disposed: bool,
}

struct Shared {
    name: String,
    inner: Mutex<Inner>,
    finished: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record how the job ended and notify listeners on failure.
    ///
    /// Listeners are released on every outcome so whatever they capture
    /// does not outlive the job.
    fn finish(&self, outcome: Result<(), RfbError>, cancelled: bool) {
        let (failure, listeners) = {
            let mut inner = self.lock();
            let listeners = std::mem::take(&mut inner.listeners);
            let failure = match outcome {
                Ok(()) => {
                    info!(task = %self.name, "background task exited");
                    inner.state = ThreadState::Stopped;
                    None
                }
                Err(RfbError::Cancelled) => {
                    debug!(task = %self.name, "background task cancelled");
                    inner.state = ThreadState::Stopped;
                    None
                }
                Err(err) if cancelled => {
                    debug!(task = %self.name, error = %err, "background task stopped with error after cancellation");
                    inner.state = ThreadState::Stopped;
                    None
                }
                Err(err) => {
                    warn!(task = %self.name, error = %err, "background task failed");
                    let err = Arc::new(err);
                    inner.state = ThreadState::Failed(Arc::clone(&err));
                    Some(err)
                }
            };
            (failure, listeners)
        };
        match failure {
            Some(err) => {
                for listener in listeners {
                    listener(Arc::clone(&err));
                }
            }
            None => drop(listeners),
        }
        self.finished.send_replace(true);
    }
}

/// One cancellable job on a Tokio runtime.
///
/// Dropping the task requests cancellation but does not wait.
pub struct BackgroundTask {
    shared: Arc<Shared>,
    handle: Handle,
    cancel: CancellationToken,
}

impl fmt::Debug for BackgroundTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .finish()
    }
}

impl BackgroundTask {
    /// Prepare `job` without starting it.
    ///
    /// Must be called from within a Tokio runtime; the job will run there.
    pub fn new<F, Fut>(name: impl Into<String>, job: F) -> Result<Self, RfbError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), RfbError>> + Send + 'static,
    {
        let handle =
            Handle::try_current().map_err(|_| LifecycleError::NoRuntime("background task"))?;
        let (finished, _) = watch::channel(false);
        let job: Job = Box::new(move |token| job(token).boxed());
        Ok(Self {
            shared: Arc::new(Shared {
                name: name.into(),
                inner: Mutex::new(Inner {
                    state: ThreadState::NotStarted,
                    job: Some(job),
                    listeners: Vec::new(),
                    disposed: false,
                }),
                finished,
            }),
            handle,
            cancel: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn state(&self) -> ThreadState {
        self.shared.lock().state.clone()
    }

    /// The token handed to the job.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn the job. Later calls are no-ops; after [`dispose`](Self::dispose)
    /// this fails with a lifecycle error.
    pub fn start(&self) -> Result<(), RfbError> {
        let job = {
            let mut inner = self.shared.lock();
            if inner.disposed {
                return Err(LifecycleError::Disposed("background task").into());
            }
            let Some(job) = inner.job.take() else {
                return Ok(());
            };
            inner.state = ThreadState::Running;
            job
        };

        info!(task = %self.shared.name, "starting background task");
        let shared = Arc::clone(&self.shared);
        let token = self.cancel.clone();
        let job_token = token.clone();
        self.handle.spawn(async move {
            let run = AssertUnwindSafe(async move { job(job_token).await }).catch_unwind();
            let outcome = match run.await {
                Ok(result) => result,
                Err(panic) => Err(RfbError::Panicked(panic_message(panic.as_ref()))),
            };
            shared.finish(outcome, token.is_cancelled());
        });
        Ok(())
    }

    /// Request cancellation and wait until the job has exited.
    ///
    /// Returns immediately when the task was never started or has already
    /// finished. Safe to call repeatedly and from several tasks at once.
    pub async fn stop_and_wait(&self) {
        if !self.request_stop() {
            return;
        }
        let mut finished = self.shared.finished.subscribe();
        // The sender lives in `shared`, which we hold, so this cannot fail.
        let _ = finished.wait_for(|done| *done).await;
        debug!(task = %self.shared.name, state = %self.state(), "background task joined");
    }

    /// Blocking form of [`stop_and_wait`](Self::stop_and_wait) for
    /// threads outside the runtime, such as a UI thread.
    ///
    /// Must not be called from a runtime worker thread.
    pub fn stop_and_wait_blocking(&self) {
        futures::executor::block_on(self.stop_and_wait());
    }

    /// Cancel and refuse any further [`start`](Self::start).
    pub fn dispose(&self) {
        let unstarted = {
            let mut inner = self.shared.lock();
            inner.disposed = true;
            inner
                .job
                .take()
                .map(|job| (job, std::mem::take(&mut inner.listeners)))
        };
        drop(unstarted);
        self.request_stop();
    }

    /// Register a callback for a non-cancellation failure.
    ///
    /// Called at most once. If the task already failed, it is called now;
    /// if it already stopped cleanly, it is dropped.
    pub fn on_failure<F>(&self, listener: F)
    where
        F: FnOnce(Arc<RfbError>) + Send + 'static,
    {
        let mut inner = self.shared.lock();
        let failed = match &inner.state {
            ThreadState::Failed(err) => Some(Arc::clone(err)),
            _ => None,
        };
        let released = matches!(inner.state, ThreadState::Stopped)
            || (inner.disposed && matches!(inner.state, ThreadState::NotStarted));
        match failed {
            Some(err) => {
                drop(inner);
                listener(err);
            }
            None if released => {}
            None => inner.listeners.push(Box::new(listener)),
        }
    }

    /// Returns `true` when there is a running job to wait for.
    fn request_stop(&self) -> bool {
        let mut inner = self.shared.lock();
        if matches!(inner.state, ThreadState::StopRequested) {
            return true;
        }
        if !matches!(inner.state, ThreadState::Running) {
            return false;
        }
        inner.state = ThreadState::StopRequested;
        drop(inner);
        debug!(task = %self.shared.name, "stop requested");
        self.cancel.cancel();
        true
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
