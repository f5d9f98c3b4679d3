//! The host's single UI-affine thread, as seen by the agent.
//!
//! Work marshalled here runs on one dedicated thread, in priority order:
//! foreground work always runs ahead of queued background work, and tests
//! are dispatched at background priority so they never starve the host's own
//! interactive work.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use hostrun_utils::timeout_future::TimeoutFuture;
use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchPriority {
    Foreground,
    Background,
}

struct Job {
    priority: DispatchPriority,
    run: Box<dyn FnOnce() + Send>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("dispatcher thread has stopped")]
    Stopped,
    #[error("dispatched work did not complete within {0:?}")]
    Timeout(Duration),
}

pub struct UiDispatcher {
    tx: Option<mpsc::Sender<Job>>,
    thread: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl UiDispatcher {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let thread = thread::Builder::new()
            .name("hostrun-ui".to_string())
            .spawn(move || pump(rx))
            .expect("failed to spawn dispatcher thread");
        let thread_id = thread.thread().id();
        Self {
            tx: Some(tx),
            thread: Some(thread),
            thread_id,
        }
    }

    /// Id of the UI-affine thread; dispatched work observes this as its own
    /// thread id.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Marshals `f` onto the dispatcher thread and awaits its completion.
    ///
    /// With `bound` set the wait is raced against that duration; without it
    /// the wait is unbounded and only ends cooperatively (dropping the
    /// returned future abandons the wait, not the queued work).
    pub async fn invoke<T, F>(
        &self,
        priority: DispatchPriority,
        bound: Option<Duration>,
        f: F,
    ) -> Result<T, DispatchError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job = Job {
            priority,
            run: Box::new(move || {
                let _ = done_tx.send(f());
            }),
        };

        self.tx
            .as_ref()
            .expect("dispatcher already shut down")
            .send(job)
            .map_err(|_| DispatchError::Stopped)?;

        match bound {
            Some(limit) => match TimeoutFuture::new(done_rx, limit).wait().await {
                Some(result) => result.map_err(|_| DispatchError::Stopped),
                None => Err(DispatchError::Timeout(limit)),
            },
            None => done_rx.await.map_err(|_| DispatchError::Stopped),
        }
    }
}

impl Default for UiDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UiDispatcher {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn pump(rx: mpsc::Receiver<Job>) {
    let mut background: VecDeque<Box<dyn FnOnce() + Send>> = VecDeque::new();

    loop {
        let next = if background.is_empty() {
            match rx.recv() {
                Ok(job) => Some(job),
                Err(_) => break,
            }
        } else {
            match rx.try_recv() {
                Ok(job) => Some(job),
                Err(mpsc::TryRecvError::Empty) => None,
                Err(mpsc::TryRecvError::Disconnected) => break,
            }
        };

        match next {
            Some(Job {
                priority: DispatchPriority::Foreground,
                run,
            }) => run(),
            Some(Job {
                priority: DispatchPriority::Background,
                run,
            }) => background.push_back(run),
            None => {
                // No foreground work pending; run one queued background job,
                // then look for new foreground work again.
                if let Some(run) = background.pop_front() {
                    run();
                }
            }
        }
    }

    // Queued background work is abandoned on shutdown.
}
