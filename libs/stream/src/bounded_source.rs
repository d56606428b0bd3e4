use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use query_api::{Schema, StreamError};

use crate::context::ExecutionContext;
use crate::demand::Demand;
use crate::stream::{DrainHandler, EndHandler, ErrorHandler, ItemHandler, ReadStream};

/// Observable lifecycle of a [`BoundedDemandSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Accepting items, no drain running.
    Idle,
    /// A drain is delivering items.
    Emitting,
    /// `end()` or `fail()` was called; no more items may be added.
    Ended,
    /// Closed by the consumer; everything is a no-op.
    Closed,
}

struct Queue<T> {
    items: VecDeque<T>,
    demand: Demand,
    /// A drain job is posted or running.
    scheduled: bool,
    emitting: bool,
    ended: bool,
    end_fired: bool,
    closed: bool,
}

struct Handlers<T> {
    item: Option<ItemHandler<T>>,
    end: Option<EndHandler>,
    error: Option<ErrorHandler>,
    drain: Option<DrainHandler>,
    /// Error reported before an error handler was installed.
    pending_error: Option<StreamError>,
}

impl<T> Default for Handlers<T> {
    fn default() -> Self {
        Self { item: None, end: None, error: None, drain: None, pending_error: None }
    }
}

enum Step<T> {
    Deliver(T),
    Stalled,
    End,
    Idle,
}

/// Bounded, demand-tracked queue bridging a blocking producer thread into
/// the pull protocol.
///
/// The producer calls [`add`](Self::add), [`end`](Self::end) and
/// [`fail`](Self::fail) from its own thread; `add` blocks while the queue is
/// full. Delivery always happens in a drain job on the owning
/// [`ExecutionContext`], never on the producer thread, so handlers have a
/// single thread affinity.
pub struct BoundedDemandSource<T> {
    ctx: ExecutionContext,
    capacity: usize,
    schema: Arc<Schema>,
    queue: Mutex<Queue<T>>,
    space: Condvar,
    handlers: Mutex<Handlers<T>>,
    me: Weak<Self>,
}

impl<T: Send + 'static> BoundedDemandSource<T> {
    pub fn new(ctx: ExecutionContext, capacity: usize, schema: Arc<Schema>) -> Result<Arc<Self>, StreamError> {
        if capacity == 0 {
            return Err(StreamError::usage("bounded source capacity must be greater than zero"));
        }
        Ok(Arc::new_cyclic(|me| Self {
            ctx,
            capacity,
            schema,
            queue: Mutex::new(Queue {
                items: VecDeque::with_capacity(capacity),
                demand: Demand::default(),
                scheduled: false,
                emitting: false,
                ended: false,
                end_fired: false,
                closed: false,
            }),
            space: Condvar::new(),
            handlers: Mutex::new(Handlers::default()),
            me: me.clone(),
        }))
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn state(&self) -> StreamState {
        let q = self.queue.lock();
        if q.closed {
            StreamState::Closed
        } else if q.ended {
            StreamState::Ended
        } else if q.emitting {
            StreamState::Emitting
        } else {
            StreamState::Idle
        }
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().items.len()
    }

    pub fn set_drain_handler(&self, handler: DrainHandler) {
        self.handlers.lock().drain = Some(handler);
    }

    /// Queue an item, blocking the calling thread while the queue is full.
    ///
    /// After `end()` this is a usage fault, after `close()` a no-op. On the
    /// owning context a full queue is a usage fault, since waiting there
    /// would stop the drain that frees space.
    pub fn add(&self, item: T) -> Result<(), StreamError> {
        let mut q = self.queue.lock();
        if q.closed {
            return Ok(());
        }
        if q.ended {
            return Err(StreamError::usage("add() called after end()"));
        }
        while q.items.len() >= self.capacity {
            if self.ctx.is_current() {
                return Err(StreamError::usage(
                    "add() on the execution context would block on a full queue",
                ));
            }
            self.space.wait(&mut q);
            if q.closed {
                return Ok(());
            }
        }
        q.items.push_back(item);
        let schedule = !q.scheduled && !q.demand.is_zero();
        if schedule {
            q.scheduled = true;
        }
        drop(q);

        if schedule {
            self.schedule_drain();
        }
        Ok(())
    }

    /// Mark the stream complete. The end handler fires once every queued
    /// item was delivered. A second call is a usage fault.
    pub fn end(&self) -> Result<(), StreamError> {
        let mut q = self.queue.lock();
        if q.closed {
            return Ok(());
        }
        if q.ended {
            return Err(StreamError::usage("end() called twice"));
        }
        q.ended = true;
        // Queued items with no demand wait for request_more, which also delivers the end.
        let schedule = !q.scheduled && (!q.demand.is_zero() || q.items.is_empty());
        if schedule {
            q.scheduled = true;
        }
        drop(q);

        if schedule {
            self.schedule_drain();
        }
        Ok(())
    }

    /// Report a producer failure. The stream ends without firing the end
    /// handler and the error reaches the error handler on the context.
    pub fn fail(&self, error: StreamError) {
        {
            let mut q = self.queue.lock();
            if q.closed || q.end_fired {
                return;
            }
            q.ended = true;
            q.end_fired = true;
            q.items.clear();
        }
        self.space.notify_all();

        let me = self.me.clone();
        self.ctx.run_on_context(move || {
            if let Some(source) = me.upgrade() {
                source.report(error);
            }
        });
    }

    fn schedule_drain(&self) {
        let me = self.me.clone();
        self.ctx.run_on_context(move || {
            if let Some(source) = me.upgrade() {
                source.drain();
            }
        });
    }

    fn drain(&self) {
        loop {
            let step = {
                let mut q = self.queue.lock();
                if q.closed {
                    q.scheduled = false;
                    q.emitting = false;
                    return;
                }
                if q.items.is_empty() {
                    q.scheduled = false;
                    q.emitting = false;
                    if q.ended && !q.end_fired {
                        q.end_fired = true;
                        Step::End
                    } else {
                        Step::Idle
                    }
                } else if q.demand.is_zero() {
                    q.scheduled = false;
                    q.emitting = false;
                    Step::Stalled
                } else {
                    q.demand.consume();
                    q.emitting = true;
                    match q.items.pop_front() {
                        Some(item) => Step::Deliver(item),
                        None => Step::Idle,
                    }
                }
            };

            match step {
                Step::Deliver(item) => {
                    self.space.notify_one();
                    let handler = self.handlers.lock().item.clone();
                    match handler {
                        Some(handler) => {
                            if let Err(e) = handler(item) {
                                self.report(e);
                            }
                        }
                        None => tracing::trace!("item delivered without a handler, dropped"),
                    }
                }
                Step::Stalled => {
                    let handler = self.handlers.lock().drain.clone();
                    if let Some(handler) = handler {
                        handler();
                    }
                    return;
                }
                Step::End => {
                    let handler = self.handlers.lock().end.clone();
                    match handler {
                        Some(handler) => handler(),
                        // Held back until an end handler is installed.
                        None => self.queue.lock().end_fired = false,
                    }
                    return;
                }
                Step::Idle => return,
            }
        }
    }

    fn report(&self, error: StreamError) {
        let handler = {
            let mut handlers = self.handlers.lock();
            match handlers.error.clone() {
                Some(handler) => handler,
                None => {
                    tracing::debug!(error = %error, "source error held until a handler is set");
                    handlers.pending_error.get_or_insert(error);
                    return;
                }
            }
        };
        handler(error);
    }
}

impl<T: Send + 'static> ReadStream<T> for BoundedDemandSource<T> {
    fn set_item_handler(&self, handler: ItemHandler<T>) {
        self.handlers.lock().item = Some(handler);
    }

    fn set_end_handler(&self, handler: EndHandler) {
        self.handlers.lock().end = Some(handler);
        let schedule = {
            let mut q = self.queue.lock();
            let schedule = q.ended && !q.end_fired && !q.closed && !q.scheduled;
            if schedule {
                q.scheduled = true;
            }
            schedule
        };
        if schedule {
            self.schedule_drain();
        }
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        let pending = {
            let mut handlers = self.handlers.lock();
            handlers.error = Some(handler);
            handlers.pending_error.take()
        };
        if let Some(error) = pending {
            let me = self.me.clone();
            self.ctx.run_on_context(move || {
                if let Some(source) = me.upgrade() {
                    source.report(error);
                }
            });
        }
    }

    fn pause(&self) {
        self.queue.lock().demand = Demand::default();
    }

    fn request_more(&self, n: i64) -> Result<(), StreamError> {
        let mut q = self.queue.lock();
        let demand = q.demand.request(n)?;
        if q.closed {
            return Ok(());
        }
        q.demand = demand;
        let pending = !q.items.is_empty() || (q.ended && !q.end_fired);
        let schedule = pending && !q.scheduled;
        if schedule {
            q.scheduled = true;
        }
        drop(q);

        if schedule {
            self.schedule_drain();
        }
        Ok(())
    }

    fn close(&self) {
        {
            let mut q = self.queue.lock();
            if q.closed {
                return;
            }
            q.closed = true;
            q.items.clear();
        }
        self.space.notify_all();
        *self.handlers.lock() = Handlers::default();
        tracing::debug!(context = %self.ctx.name(), "bounded source closed");
    }
}
