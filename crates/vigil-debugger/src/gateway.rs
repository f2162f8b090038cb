//! Synchronous request gateway to the backend connection.
//!
//! The legacy and JDWP backends are not safe for concurrent calls, so a
//! single dedicated worker thread takes exclusive ownership of the
//! connection and executes submitted closures one at a time. Callers block
//! for the result with a deadlock timeout.
//!
//! A worker thread cannot be forcibly terminated; when a call exceeds the
//! timeout the gateway abandons the worker instead (marks itself poisoned
//! so later calls fail fast) and fires the registered kill callback exactly
//! once. The callback is expected to kill the debuggee process and notify
//! the user.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use vigil_backend::{BackendError, DebugBackend};

use crate::error::{DebugError, DebugResult};

type Job = Box<dyn FnOnce(&mut dyn DebugBackend) + Send>;
type KillCallback = Box<dyn FnOnce() + Send>;

pub struct RequestGateway {
    jobs: mpsc::Sender<Job>,
    poisoned: Arc<AtomicBool>,
    kill: Arc<Mutex<Option<KillCallback>>>,
    timeout: Duration,
}

impl RequestGateway {
    /// Spawn the worker and hand it exclusive ownership of `backend`.
    pub fn new(
        backend: Box<dyn DebugBackend>,
        timeout: Duration,
        kill: impl FnOnce() + Send + 'static,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        std::thread::spawn(move || {
            let mut backend = backend;
            while let Ok(job) = rx.recv() {
                // A panicking backend call must not take the worker down
                // with it; the caller sees a disconnected reply channel.
                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    job(&mut *backend)
                }));
            }
            backend.disconnect();
        });

        Self {
            jobs: tx,
            poisoned: Arc::new(AtomicBool::new(false)),
            kill: Arc::new(Mutex::new(Some(Box::new(kill)))),
            timeout,
        }
    }

    /// Run `work` on the backend worker and block for its result.
    ///
    /// Backend errors are propagated typed; a timeout poisons the gateway,
    /// fires the kill callback once and returns [`DebugError::Deadlock`].
    pub fn run_blocking<R, F>(&self, work: F) -> DebugResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn DebugBackend) -> Result<R, BackendError> + Send + 'static,
    {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(DebugError::Deadlock);
        }

        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move |backend| {
            let _ = tx.send(work(backend));
        });
        if self.jobs.send(job).is_err() {
            return Err(DebugError::BackendUnavailable);
        }

        match rx.recv_timeout(self.timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(err.into()),
            Err(RecvTimeoutError::Timeout) => {
                self.poison();
                Err(DebugError::Deadlock)
            }
            // The job panicked (reply sender dropped) or the worker is gone.
            Err(RecvTimeoutError::Disconnected) => Err(DebugError::BackendUnavailable),
        }
    }

    /// Best-effort variant: failures are logged and swallowed. Used for
    /// calls like resume-after-step where the session must not fail even
    /// if the backend does.
    pub fn run_blocking_ignoring_errors<F>(&self, work: F)
    where
        F: FnOnce(&mut dyn DebugBackend) -> Result<(), BackendError> + Send + 'static,
    {
        if let Err(err) = self.run_blocking(work) {
            tracing::warn!(%err, "ignoring failed backend call");
        }
    }

    /// Whether a deadlock timeout has made this gateway unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    fn poison(&self) {
        if self.poisoned.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::error!(
            timeout_ms = self.timeout.as_millis() as u64,
            "backend call exceeded deadlock timeout; abandoning worker"
        );
        if let Some(kill) = self.kill.lock().take() {
            kill();
        }
    }
}
