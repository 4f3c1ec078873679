//! Cancellation and bounded shutdown for worker threads.

use log::warn;
use sd_notify::NotifyState;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Shared "stop now" flag that sleepers can wait on.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the token is cancelled.
    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            cancelled = cvar.wait(cancelled).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// `Err(ShutdownError::Interrupted(stage))` once the token is cancelled.
    pub fn checkpoint(&self, stage: &'static str) -> Result<(), ShutdownError> {
        if self.is_cancelled() {
            return Err(ShutdownError::Interrupted(stage));
        }
        Ok(())
    }

    /// Sleep for up to `timeout`. Returns true as soon as the token is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = lock.lock().unwrap_or_else(PoisonError::into_inner);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = cvar
                .wait_timeout(cancelled, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        true
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ShutdownError {
    /// The worker was still running when the grace period ran out.
    GracePeriodExceeded(Duration),
    /// The worker went away without reporting (panicked).
    WorkerLost,
    /// Cancelled before startup finished; the named stage was the last one completed.
    Interrupted(&'static str),
}

impl Display for ShutdownError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownError::GracePeriodExceeded(d) => {
                write!(f, "unclean shutdown: worker still running after {}s", d.as_secs())
            }
            ShutdownError::WorkerLost => write!(f, "unclean shutdown: worker exited without reporting"),
            ShutdownError::Interrupted(stage) => write!(f, "interrupted after {}", stage),
        }
    }
}

impl Error for ShutdownError {}

/// Wait for the worker's exit report, but no longer than `grace`.
pub fn await_worker<T>(exit: &Receiver<T>, grace: Duration) -> Result<T, ShutdownError> {
    match exit.recv_timeout(grace) {
        Ok(report) => Ok(report),
        Err(RecvTimeoutError::Timeout) => Err(ShutdownError::GracePeriodExceeded(grace)),
        Err(RecvTimeoutError::Disconnected) => Err(ShutdownError::WorkerLost),
    }
}

/// Tell the service manager that startup is complete. Without a notify socket
/// this does nothing; a failed notification is logged and otherwise ignored.
pub fn notify_ready() -> bool {
    match sd_notify::notify(false, &[NotifyState::Ready]) {
        Ok(()) => true,
        Err(e) => {
            warn!("systemd readiness notification failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn wait_returns_early_on_cancel() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });

        let started = Instant::now();
        assert!(token.wait_timeout(Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(token.is_cancelled());
        handle.join().expect("canceller");
    }

    #[test]
    fn wait_blocks_until_cancelled() {
        let token = CancellationToken::new();
        let remote = token.clone();
        let handle = thread::spawn(move || remote.wait());
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        token.cancel();
        handle.join().expect("waiter");
    }

    #[test]
    fn checkpoint_reports_the_stage() {
        let token = CancellationToken::new();
        assert_eq!(token.checkpoint("database connect"), Ok(()));
        token.cancel();
        let err = token.checkpoint("history sync").expect_err("cancelled");
        assert_eq!(err, ShutdownError::Interrupted("history sync"));
        assert_eq!(err.to_string(), "interrupted after history sync");
    }

    #[test]
    fn ready_notification_without_socket_is_a_no_op() {
        if std::env::var_os("NOTIFY_SOCKET").is_none() {
            assert!(notify_ready());
        }
    }

    #[test]
    fn wait_times_out_when_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(10)));
        assert!(!token.is_cancelled());
    }

    #[test]
    fn await_worker_reports_each_outcome() {
        let (tx, rx) = mpsc::channel::<u32>();
        tx.send(7).expect("send");
        assert_eq!(await_worker(&rx, Duration::from_millis(10)), Ok(7));

        assert_eq!(
            await_worker(&rx, Duration::from_millis(10)),
            Err(ShutdownError::GracePeriodExceeded(Duration::from_millis(10)))
        );

        drop(tx);
        assert_eq!(await_worker(&rx, Duration::from_millis(10)), Err(ShutdownError::WorkerLost));
    }
}
