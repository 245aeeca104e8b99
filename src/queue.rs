//! Deferred request execution
//!
//! Hosts that want every task of a database to run on one thread (e.g. a
//! simulation loop) configure a `RequestQueue`. Requests are buffered by
//! `enqueue` and executed when the host calls `drain`, strictly in enqueue
//! order. Jobs enqueued while a drain runs wait for the next drain.

use crate::error::{HubError, HubResult};
use crate::hub::Hub;
use crate::protocol::{SyncRequest, SyncResponse};
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::mem;
use std::panic::AssertUnwindSafe;
use tokio::sync::oneshot;

/// Batch buffer drained as a whole. The lock is held only to append a job
/// or to swap the buffer out.
pub struct DeferredQueue<J> {
    pending: Mutex<Vec<J>>,
}

impl<J> DeferredQueue<J> {
    pub fn new() -> Self {
        DeferredQueue {
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, job: J) {
        self.pending.lock().push(job);
    }

    /// Take all pending jobs, leaving the queue empty
    pub fn take(&self) -> Vec<J> {
        mem::take(&mut *self.pending.lock())
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl<J> Default for DeferredQueue<J> {
    fn default() -> Self {
        DeferredQueue::new()
    }
}

/// Outcome delivered to the caller of `enqueue`
pub type RequestCompletion = HubResult<SyncResponse>;

struct RequestJob {
    request: SyncRequest,
    completion: oneshot::Sender<RequestCompletion>,
}

pub struct RequestQueue {
    jobs: DeferredQueue<RequestJob>,
}

impl RequestQueue {
    pub fn new() -> Self {
        RequestQueue {
            jobs: DeferredQueue::new(),
        }
    }

    /// Buffer a request. The receiver resolves once a drain executed it.
    pub fn enqueue(&self, request: SyncRequest) -> oneshot::Receiver<RequestCompletion> {
        let (completion, receiver) = oneshot::channel();
        self.jobs.push(RequestJob { request, completion });
        receiver
    }

    pub fn pending(&self) -> usize {
        self.jobs.len()
    }

    /// Execute all buffered requests in FIFO order on the calling task.
    /// Fully synchronous requests take the sync path, the others are awaited
    /// before the next job starts. Returns the number of executed jobs.
    pub async fn drain(&self, hub: &Hub) -> usize {
        let jobs = self.jobs.take();
        let count = jobs.len();
        for job in jobs {
            let RequestJob { request, completion } = job;
            let outcome = AssertUnwindSafe(hub.execute_direct(&request)).catch_unwind().await;
            let result = outcome.map_err(|panic| {
                let message = panic_message(panic.as_ref());
                tracing::error!(database = %request.database, error = %message, "queued request panicked");
                HubError::Execution(message)
            });
            if completion.send(result).is_err() {
                tracing::debug!(database = %request.database, "queued request abandoned by caller");
            }
        }
        if count > 0 {
            tracing::debug!(jobs = count, "request queue drained");
        }
        count
    }

    /// `drain` for hosts without a runtime. Must not be called from within
    /// an async context.
    pub fn drain_blocking(&self, hub: &Hub) -> HubResult<usize> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        Ok(runtime.block_on(self.drain(hub)))
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        RequestQueue::new()
    }
}

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
