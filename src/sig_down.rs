//! Process signal handling.
//!
//! SIGTERM and SIGINT trigger the shared cancellation token: the HTTP
//! server drains gracefully and every background worker (sweepers, audit
//! sink, touch worker) observes the same token. SIGHUP requests a policy
//! reload without restarting.

use tokio::signal::unix::SignalKind;
use tokio::signal::unix::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct SigDown {
    _task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
    reload_rx: Option<mpsc::UnboundedReceiver<()>>,
}

impl SigDown {
    /// Registers the signal handlers.
    ///
    /// Returns an error if signal registration fails.
    pub fn try_new() -> Result<Self, std::io::Error> {
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sighup = signal(SignalKind::hangup())?;
        let inner = CancellationToken::new();
        let outer = inner.clone();
        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        let task_tracker = TaskTracker::new();
        task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = sigterm.recv() => {
                        inner.cancel();
                        break;
                    },
                    _ = sigint.recv() => {
                        inner.cancel();
                        break;
                    },
                    _ = sighup.recv() => {
                        let _ = reload_tx.send(());
                    }
                }
            }
        });
        task_tracker.close();
        Ok(Self {
            _task_tracker: task_tracker,
            cancellation_token: outer,
            reload_rx: Some(reload_rx),
        })
    }

    /// Returns a clone of the cancellation token for distributing to subsystems.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Takes the SIGHUP reload stream; yields once per received signal.
    pub fn take_reload_signal(&mut self) -> Option<mpsc::UnboundedReceiver<()>> {
        self.reload_rx.take()
    }
}
