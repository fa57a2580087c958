use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};

/// State shared by the server and the client: a shutdown signal every task watches, and a barrier which lets the owner
/// wait for every task it spawned.
///
/// The barrier is a channel nobody sends on.  Each task holds a [TaskGuard] wrapping a sender; once the base and every
/// guard have dropped their senders, the receiver sees the channel close.
pub(crate) struct SocketBase {
    shutdown: watch::Sender<bool>,
    guard: Mutex<Option<mpsc::Sender<()>>>,
    barrier: Mutex<Option<mpsc::Receiver<()>>>,
    drained: watch::Sender<bool>,
}

/// Held by a running task for as long as the barrier should wait on it.
pub(crate) struct TaskGuard {
    _sender: mpsc::Sender<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SocketBase {
    pub(crate) fn new() -> SocketBase {
        let (shutdown, _) = watch::channel(false);
        let (sender, receiver) = mpsc::channel(1);
        let (drained, _) = watch::channel(false);
        SocketBase {
            shutdown,
            guard: Mutex::new(Some(sender)),
            barrier: Mutex::new(Some(receiver)),
            drained,
        }
    }

    /// Get a guard for a new task, or `None` once shutdown has started.
    pub(crate) fn track(&self) -> Option<TaskGuard> {
        lock(&self.guard).as_ref().map(|s| TaskGuard { _sender: s.clone() })
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Signal shutdown, then wait until every tracked task has finished.
    ///
    /// Any number of callers may wait at once; all of them return once the barrier has drained.
    pub(crate) async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        drop(lock(&self.guard).take());

        let barrier = lock(&self.barrier).take();
        match barrier {
            Some(mut barrier) => {
                while barrier.recv().await.is_some() {}
                self.drained.send_replace(true);
            }
            None => {
                let mut drained = self.drained.subscribe();
                loop {
                    let done = *drained.borrow();
                    if done || drained.changed().await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
