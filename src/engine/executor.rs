//! Callback executors and the dedicated network runtime.
//!
//! All engine-internal state lives on one network thread driving a
//! current-thread tokio runtime; public API calls post work onto it and
//! return. User callbacks are delivered through the `Executor` supplied
//! per request, never from under an internal lock.

use std::io;
use std::sync::Arc;

/// Delivers request callbacks. Implementations must be thread-safe; the
/// engine posts closures from its network thread.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>);
}

/// Runs callbacks inline on the posting thread. The callback must not
/// block; blocking stalls the network task.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        task();
    }
}

/// Dedicated thread executor backed by an unbounded queue; callbacks run
/// in post order.
pub struct SingleThreadExecutor {
    tx: std::sync::Mutex<Option<std::sync::mpsc::Sender<Box<dyn FnOnce() + Send + 'static>>>>,
    thread: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SingleThreadExecutor {
    pub fn new() -> io::Result<Arc<Self>> {
        let (tx, rx) = std::sync::mpsc::channel::<Box<dyn FnOnce() + Send + 'static>>();
        let thread = std::thread::Builder::new()
            .name("corenet-callbacks".into())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            })?;
        Ok(Arc::new(Self {
            tx: std::sync::Mutex::new(Some(tx)),
            thread: std::sync::Mutex::new(Some(thread)),
        }))
    }

    /// Stop accepting tasks, drain the queue, and join the thread.
    pub fn shutdown(&self) {
        // Dropping the sender ends the recv loop after queued tasks run.
        drop(self.tx.lock().unwrap().take());
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }
}

impl Executor for SingleThreadExecutor {
    fn execute(&self, task: Box<dyn FnOnce() + Send + 'static>) {
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            let _ = tx.send(task);
        }
    }
}

/// The engine's cooperative network task: one thread, one current-thread
/// tokio runtime. Everything that mutates engine state is spawned here.
pub struct NetworkRunner {
    handle: tokio::runtime::Handle,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl NetworkRunner {
    pub fn start() -> io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("corenet-network".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let _ = shutdown_rx.await;
                });
                // Outstanding tasks are dropped with the runtime.
            })?;
        Ok(Self {
            handle,
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.handle
    }

    /// Post a future onto the network task.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Stop the runtime and join the thread. Pending tasks are dropped;
    /// callers drain their work first.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for NetworkRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
