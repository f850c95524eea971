//! # Worker Pool
//!
//! Fixed pool of OS threads running handlers. Each worker owns one
//! [`ConnectionContext`] for its whole life; the tokio side only moves
//! requests in and responses out.
//!
//! - Jobs: `std::sync::mpsc`, receiver shared behind a `Mutex`
//! - Replies: `tokio::sync::oneshot`
//! - Stop: `CancellationToken`, polled between jobs

use crate::context::ConnectionContext;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::handler::HandlerError;
use crate::request::Request;
use crate::server::Response;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct Job {
    request: Request,
    reply: oneshot::Sender<Response>,
}

/// Handler threads with per-thread connection contexts
pub struct WorkerPool {
    sender: Sender<Job>,
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Spawn `size` workers; `make_context` runs once per worker
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if a thread cannot be spawned.
    pub fn new<F>(
        size: usize,
        dispatcher: Arc<Dispatcher>,
        debug: bool,
        make_context: F,
    ) -> Result<Self>
    where
        F: Fn() -> ConnectionContext,
    {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let token = CancellationToken::new();

        let mut handles = Vec::with_capacity(size);
        for id in 0..size.max(1) {
            let worker = Worker {
                id,
                receiver: Arc::clone(&receiver),
                dispatcher: Arc::clone(&dispatcher),
                ctx: make_context(),
                token: token.clone(),
                debug,
            };
            let handle = std::thread::Builder::new()
                .name(format!("pblog-worker-{id}"))
                .spawn(move || worker.run())?;
            handles.push(handle);
        }
        info!(workers = handles.len(), "worker pool started");

        Ok(Self {
            sender,
            token,
            handles: Mutex::new(handles),
        })
    }

    /// Hand a request to the next free worker and wait for its response
    pub async fn submit(&self, request: Request) -> Response {
        let (reply, response) = oneshot::channel();
        if self.sender.send(Job { request, reply }).is_err() {
            return Response::plain(503, "Service Unavailable");
        }
        response
            .await
            .unwrap_or_else(|_| Response::plain(500, "Internal Server Error"))
    }

    /// Stop every worker after its current job and wait for them
    pub fn shutdown(&self) {
        self.token.cancel();
        let handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        info!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Worker {
    id: usize,
    receiver: Arc<Mutex<Receiver<Job>>>,
    dispatcher: Arc<Dispatcher>,
    ctx: ConnectionContext,
    token: CancellationToken,
    debug: bool,
}

impl Worker {
    fn run(mut self) {
        info!(worker = self.id, "worker started");
        while !self.token.is_cancelled() {
            let job = self
                .receiver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .recv_timeout(POLL_INTERVAL);
            match job {
                Ok(job) => {
                    let response = self.handle(&job.request);
                    // the client may have gone away
                    let _ = job.reply.send(response);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!(worker = self.id, "worker stopped");
    }

    fn handle(&mut self, request: &Request) -> Response {
        let dispatcher = &self.dispatcher;
        let ctx = &mut self.ctx;
        let outcome = catch_unwind(AssertUnwindSafe(|| dispatcher.handle(request, ctx)));
        match outcome {
            Ok(result) => Response::from_dispatch(result, self.debug),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                Response::from_dispatch(
                    Err(HandlerError::Other(anyhow::anyhow!("panic: {message}"))),
                    self.debug,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::BootstrapConfig;
    use crate::handler::{HandlerResult, Reply};
    use crate::module::Module;
    use crate::testing::{Event, RecordingDriver};

    fn pool(driver: &RecordingDriver, workers: usize) -> WorkerPool {
        let dispatcher = Arc::new(
            Dispatcher::new(BootstrapConfig::default()).module("test", || {
                Module::new()
                    .get("/thread", |_, _| {
                        let name = std::thread::current().name().unwrap_or("").to_string();
                        Ok(Reply::Text(name))
                    })
                    .post("/boom", |ex, _| {
                        ex.db().with_transaction(|db| -> HandlerResult {
                            db.execute_sql("INSERT INTO t VALUES (1)", vec![])?;
                            panic!("handler bug")
                        })
                    })
            }),
        );
        let driver = driver.clone();
        WorkerPool::new(workers, dispatcher, false, move || {
            ConnectionContext::new(Arc::new(driver.clone()))
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_requests_run_on_worker_threads() {
        let driver = RecordingDriver::new();
        let pool = pool(&driver, 2);

        let response = pool.submit(Request::get("/thread")).await;
        assert_eq!(response.status, 200);
        assert!(String::from_utf8_lossy(&response.body).starts_with("pblog-worker-"));

        let missing = pool.submit(Request::get("/missing")).await;
        assert_eq!(missing.status, 404);

        pool.shutdown();
    }

    #[tokio::test]
    async fn test_panicking_handler_rolls_back_and_worker_survives() {
        let driver = RecordingDriver::new();
        let pool = pool(&driver, 1);

        let request = Request::new(crate::router::Method::Post, "/boom", Default::default(), None);
        let response = pool.submit(request).await;
        assert_eq!(response.status, 500);
        assert_eq!(driver.count(&Event::Rollback), 1);
        assert_eq!(driver.count(&Event::Close), 1);

        let response = pool.submit(Request::get("/thread")).await;
        assert_eq!(response.status, 200);

        pool.shutdown();
    }
}
