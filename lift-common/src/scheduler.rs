use log::*;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::{
    sync::mpsc::UnboundedSender,
    task::{self, AbortHandle},
    time::{Duration, Instant, sleep_until},
};

/// Handle to one scheduled callback. Cancelling is idempotent, and cancelling a
/// callback that already ran does nothing.
#[derive(Debug)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    abort: AbortHandle,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.abort.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

/// Runs `f` once `deadline` is reached, unless the returned handle is cancelled first.
/// The cancellation token is checked after the sleep, so a callback whose task was
/// already woken when `cancel()` was called still does nothing.
pub fn run_at<F>(deadline: Instant, f: F) -> CancelHandle
where
    F: FnOnce() + Send + 'static,
{
    let cancelled = Arc::new(AtomicBool::new(false));
    let token = cancelled.clone();
    let join = task::spawn(async move {
        sleep_until(deadline).await;
        if token.load(Ordering::SeqCst) {
            trace!("Scheduled callback fired after being cancelled, ignoring");
        } else {
            f();
        }
    });

    CancelHandle {
        cancelled,
        abort: join.abort_handle(),
    }
}

pub fn run_after<F>(delay: Duration, f: F) -> CancelHandle
where
    F: FnOnce() + Send + 'static,
{
    run_at(Instant::now() + delay, f)
}

/// Posts messages back into a single-writer loop at a later time
#[derive(Debug)]
pub struct Scheduler<M> {
    tx: UnboundedSender<M>,
}

impl<M> Clone for Scheduler<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M: Send + 'static> Scheduler<M> {
    pub fn new(tx: UnboundedSender<M>) -> Self {
        Self { tx }
    }

    pub fn schedule_at(&self, deadline: Instant, msg: M) -> CancelHandle {
        let tx = self.tx.clone();
        run_at(deadline, move || {
            if tx.send(msg).is_err() {
                debug!("Scheduled message dropped, the receiver has stopped");
            }
        })
    }

    pub fn schedule_in(&self, delay: Duration, msg: M) -> CancelHandle {
        self.schedule_at(Instant::now() + delay, msg)
    }
}
