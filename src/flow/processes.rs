//! Shared wait and error coordination for a single flow execution.

use crate::Error;
use std::sync::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Counts outstanding node activations and holds the first fatal error of a
/// flow execution. Recording a fatal error cancels the execution token so
/// cooperating calls abort; activations observe the flag and stop fanning
/// out.
#[derive(Debug)]
pub struct Processes {
    count: Mutex<usize>,
    notify: Notify,
    fatal: Mutex<Option<Error>>,
    token: CancellationToken,
}

impl Processes {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            count: Mutex::new(0),
            notify: Notify::new(),
            fatal: Mutex::new(None),
            token,
        }
    }

    /// Registers `n` pending activations.
    pub fn add(&self, n: usize) {
        *lock(&self.count) += n;
    }

    /// Marks one activation as finished, waking waiters when none remain.
    pub fn done(&self) {
        let mut count = lock(&self.count);
        *count = count.saturating_sub(1);

        if *count == 0 {
            self.notify.notify_waiters();
        }
    }

    /// Records a fatal error; the first writer wins. Cancels the execution
    /// token either way.
    pub fn fatal(&self, err: Error) {
        {
            let mut fatal = lock(&self.fatal);
            if fatal.is_none() {
                *fatal = Some(err);
            } else {
                tracing::debug!(error = %err, "discarding subsequent fatal error");
            }
        }

        self.token.cancel();
    }

    /// Reports whether a fatal error has been recorded.
    pub fn faulted(&self) -> bool {
        lock(&self.fatal).is_some()
    }

    /// Takes the recorded fatal error, if any.
    pub fn take(&self) -> Option<Error> {
        lock(&self.fatal).take()
    }

    /// Reports whether the execution token has been canceled, either by a
    /// fatal error or by the ambient context.
    pub fn cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Blocks until no activations remain outstanding.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // register before the counter check so no wakeup is lost
            notified.as_mut().enable();

            if *lock(&self.count) == 0 {
                return;
            }

            notified.await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
