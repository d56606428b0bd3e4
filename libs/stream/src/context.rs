use std::cell::Cell;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() + Send + 'static>;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Id of the context whose job is running on this thread, 0 if none.
    static CURRENT: Cell<u64> = const { Cell::new(0) };
}

/// Serialized executor owned by one pipeline instance.
///
/// Every callback of the instance runs as a job on this context, one at a
/// time and in posting order. Jobs never run re-entrantly on the caller.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    name: String,
    tx: mpsc::UnboundedSender<Job>,
}

/// Restores the thread-local marker even if a job panics.
struct CurrentGuard(u64);

impl CurrentGuard {
    fn enter(id: u64) -> Self {
        Self(CURRENT.with(|c| c.replace(id)))
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.0));
    }
}

impl ExecutionContext {
    /// Start a context on the current tokio runtime.
    ///
    /// The job loop ends once every handle to the context is dropped.
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let name = name.into();

        let loop_name = name.clone();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let _guard = CurrentGuard::enter(id);
                job();
            }
            tracing::trace!(context = %loop_name, "execution context stopped");
        });

        Self { inner: Arc::new(Inner { id, name, tx }) }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the calling code runs inside a job of this context.
    pub fn is_current(&self) -> bool {
        CURRENT.with(|c| c.get() == self.inner.id)
    }

    /// Post a job. It runs after every job posted before it.
    pub fn run_on_context(&self, job: impl FnOnce() + Send + 'static) {
        if self.inner.tx.send(Box::new(job)).is_err() {
            tracing::debug!(context = %self.inner.name, "job dropped, context stopped");
        }
    }

    /// Run `future` on the runtime and hand its output to `then` on this
    /// context.
    pub fn spawn_async<F, T>(&self, future: F, then: impl FnOnce(T) + Send + 'static)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let ctx = self.clone();
        tokio::spawn(async move {
            let output = future.await;
            ctx.run_on_context(move || then(output));
        });
    }

    /// Resolves once every job posted before the call has run.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.run_on_context(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}
