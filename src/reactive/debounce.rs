use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::config::SyncConfig;

enum Signal {
    Trigger,
    Flush(oneshot::Sender<()>),
    Cancel,
    Stop,
}

#[derive(Clone, Copy)]
struct Burst {
    started: Instant,
    deadline: Instant,
}

/// Cheap, cloneable trigger for a [`Debouncer`].
#[derive(Clone)]
pub struct DebounceHandle {
    tx: mpsc::UnboundedSender<Signal>,
}

impl DebounceHandle {
    /// Schedules the action. Returns `false` once the debouncer has stopped.
    pub fn trigger(&self) -> bool {
        self.tx.send(Signal::Trigger).is_ok()
    }
}

/// Runs an async action after triggers stop arriving for `debounce_delay`,
/// and at the latest `debounce_max_wait` after the first trigger of a burst.
///
/// The action runs on the debouncer's own task, one run at a time. Triggers
/// that arrive while it runs start the next burst. When every handle is
/// dropped, a pending run is executed before the task exits.
pub struct Debouncer {
    handle: DebounceHandle,
    task: JoinHandle<()>,
}

impl Debouncer {
    /// Spawns the debouncer task. Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(config: &SyncConfig, action: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, config.debounce_delay, config.debounce_max_wait, action));
        Self {
            handle: DebounceHandle { tx },
            task,
        }
    }

    pub fn handle(&self) -> DebounceHandle {
        self.handle.clone()
    }

    pub fn trigger(&self) -> bool {
        self.handle.trigger()
    }

    /// Runs a pending action right away and waits for it, and for any run
    /// already in progress, to finish.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.handle.tx.send(Signal::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Drops the pending action, if any. A run already in progress is not affected.
    pub fn cancel(&self) {
        let _ = self.handle.tx.send(Signal::Cancel);
    }

    /// Drops the pending action and stops the task, waiting for a run that
    /// has already started.
    pub async fn close(self) {
        let _ = self.handle.tx.send(Signal::Cancel);
        let _ = self.handle.tx.send(Signal::Stop);
        if let Err(e) = self.task.await {
            log::error!("debounce task ended abnormally: {e}");
        }
    }
}

impl std::fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Debouncer")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

async fn run<F, Fut>(
    mut rx: mpsc::UnboundedReceiver<Signal>,
    delay: Duration,
    max_wait: Duration,
    mut action: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut burst: Option<Burst> = None;

    loop {
        let fire_at = burst.map(|b| b.deadline.min(b.started + max_wait));
        let signal = match fire_at {
            None => rx.recv().await,
            Some(at) => {
                tokio::select! {
                    signal = rx.recv() => signal,
                    _ = sleep_until(at) => {
                        burst = None;
                        action().await;
                        continue;
                    }
                }
            }
        };

        match signal {
            Some(Signal::Trigger) => {
                let now = Instant::now();
                burst = Some(Burst {
                    started: burst.map_or(now, |b| b.started),
                    deadline: now + delay,
                });
            }
            Some(Signal::Flush(ack)) => {
                if burst.take().is_some() {
                    action().await;
                }
                let _ = ack.send(());
            }
            Some(Signal::Cancel) => {
                if burst.take().is_some() {
                    log::debug!("pending debounced run cancelled");
                }
            }
            Some(Signal::Stop) => break,
            None => {
                if burst.take().is_some() {
                    action().await;
                }
                break;
            }
        }
    }
}
