use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use query_api::StreamError;

use crate::context::ExecutionContext;
use crate::demand::Demand;
use crate::stream::{
    Ack, CloseHandler, DrainHandler, EndHandler, ErrorHandler, ItemHandler, ReadStream, WriteStream,
    ack_channel, ready_ack,
};

/// Outcome of transforming one item.
#[derive(Debug)]
pub enum Transformed<T> {
    /// Forward the item.
    Emit(T),
    /// Drop the item.
    Skip,
    /// Forward the item, then end downstream and stop pulling upstream.
    Last(T),
    /// End downstream and stop pulling upstream without forwarding.
    Finish,
}

pub type TransformFuture<T> = BoxFuture<'static, Result<Transformed<T>, StreamError>>;

pub type FlushFuture<T> = BoxFuture<'static, Result<Vec<T>, StreamError>>;

/// Per-item asynchronous transform run by an [`AsyncTransformStage`].
///
/// An `Err` of kind `Transform` is reported and the item dropped; any other
/// kind fails the pipeline.
pub trait Transform<T>: Send + Sync {
    fn apply(&self, item: T) -> TransformFuture<T>;

    /// Items held back by `apply`, released once upstream has ended and
    /// before the end is forwarded. `None` when the transform holds nothing.
    fn flush(&self) -> Option<FlushFuture<T>> {
        None
    }
}

impl<T, F> Transform<T> for F
where
    F: Fn(T) -> TransformFuture<T> + Send + Sync,
{
    fn apply(&self, item: T) -> TransformFuture<T> {
        self(item)
    }
}

struct Slot<T> {
    /// A transform is running or its output waits for downstream demand.
    in_flight: bool,
    output: Option<(T, bool)>,
    /// Items released by [`Transform::flush`], waiting for downstream demand.
    tail: VecDeque<T>,
    flushing: bool,
    ack: Option<oneshot::Sender<Result<(), StreamError>>>,
    demand: Demand,
    end_requested: bool,
    ended: bool,
    finished: bool,
    closed: bool,
}

struct StageHandlers<T> {
    item: Option<ItemHandler<T>>,
    end: Option<EndHandler>,
    error: Option<ErrorHandler>,
    drain: Option<DrainHandler>,
    close: Option<CloseHandler>,
}

/// Single-slot asynchronous transform with the same demand protocol on
/// both sides.
///
/// At most one item is in flight. The slot doubles as the one-item output
/// buffer: a transformed item waiting for downstream demand keeps the slot
/// occupied, so upstream stalls until downstream asks for more.
pub struct AsyncTransformStage<T> {
    ctx: ExecutionContext,
    name: String,
    transform: Arc<dyn Transform<T>>,
    slot: Mutex<Slot<T>>,
    handlers: Mutex<StageHandlers<T>>,
    me: Weak<Self>,
}

impl<T: Send + 'static> AsyncTransformStage<T> {
    pub fn new(ctx: ExecutionContext, name: impl Into<String>, transform: Arc<dyn Transform<T>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            ctx,
            name: name.into(),
            transform,
            slot: Mutex::new(Slot {
                in_flight: false,
                output: None,
                tail: VecDeque::new(),
                flushing: false,
                ack: None,
                demand: Demand::default(),
                end_requested: false,
                ended: false,
                finished: false,
                closed: false,
            }),
            handlers: Mutex::new(StageHandlers {
                item: None,
                end: None,
                error: None,
                drain: None,
                close: None,
            }),
            me: me.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.slot.lock().finished
    }

    fn complete(&self, result: Result<Transformed<T>, StreamError>, ack: oneshot::Sender<Result<(), StreamError>>) {
        if self.slot.lock().closed {
            let _ = ack.send(Err(StreamError::cancelled(format!("stage [{}] closed", self.name))));
            return;
        }
        match result {
            Ok(Transformed::Emit(item)) => self.hold(item, false, ack),
            Ok(Transformed::Last(item)) => self.hold(item, true, ack),
            Ok(Transformed::Skip) => {
                let _ = ack.send(Ok(()));
                self.release();
            }
            Ok(Transformed::Finish) => {
                let _ = ack.send(Ok(()));
                self.finish();
            }
            Err(e) => {
                let _ = ack.send(Err(e.clone()));
                self.report(e);
                self.release();
            }
        }
    }

    fn hold(&self, item: T, last: bool, ack: oneshot::Sender<Result<(), StreamError>>) {
        {
            let mut slot = self.slot.lock();
            slot.output = Some((item, last));
            slot.ack = Some(ack);
        }
        self.emit();
    }

    /// Forward the held output if downstream has demand.
    fn emit(&self) {
        let (item, last, ack) = {
            let mut slot = self.slot.lock();
            if slot.closed || slot.demand.is_zero() {
                return;
            }
            let Some((item, last)) = slot.output.take() else {
                return;
            };
            slot.demand.consume();
            (item, last, slot.ack.take())
        };

        let handler = self.handlers.lock().item.clone();
        let delivered = match handler {
            Some(handler) => handler(item),
            None => Ok(()),
        };
        if let Some(ack) = ack {
            let _ = ack.send(delivered.clone());
        }
        if let Err(e) = delivered {
            self.report(e);
        }

        if last { self.finish() } else { self.release() }
    }

    /// Free the slot: either deliver a deferred end or ask for more.
    fn release(&self) {
        let end_now = {
            let mut slot = self.slot.lock();
            slot.in_flight = false;
            if slot.closed || slot.finished {
                return;
            }
            let end_now = slot.end_requested && !slot.ended;
            if end_now {
                slot.ended = true;
            }
            end_now
        };

        if end_now {
            self.end_stream();
        } else {
            let handler = self.handlers.lock().drain.clone();
            if let Some(handler) = handler {
                handler();
            }
        }
    }

    fn finish(&self) {
        let fire_end = {
            let mut slot = self.slot.lock();
            slot.in_flight = false;
            slot.finished = true;
            let fire_end = !slot.ended && !slot.closed;
            slot.ended = true;
            fire_end
        };
        tracing::debug!(stage = %self.name, "stage finished, closing upstream");
        if fire_end {
            self.fire_end();
        }
        self.close_upstream();
    }

    /// Release whatever the transform held back, then end downstream.
    fn end_stream(&self) {
        let Some(future) = self.transform.flush() else {
            self.fire_end();
            return;
        };
        {
            let mut slot = self.slot.lock();
            if slot.closed {
                return;
            }
            slot.flushing = true;
        }
        tracing::debug!(stage = %self.name, "flushing held items");
        let me = self.me.clone();
        self.ctx.spawn_async(future, move |result| {
            if let Some(stage) = me.upgrade() {
                stage.flushed(result);
            }
        });
    }

    fn flushed(&self, result: Result<Vec<T>, StreamError>) {
        match result {
            Ok(items) => {
                let mut slot = self.slot.lock();
                if slot.closed {
                    return;
                }
                slot.tail = items.into();
            }
            Err(e) => self.report(e),
        }
        self.emit_tail();
    }

    /// Deliver flushed items while downstream has demand; end once drained.
    fn emit_tail(&self) {
        loop {
            let next = {
                let mut slot = self.slot.lock();
                if slot.closed || !slot.flushing {
                    return;
                }
                if slot.tail.is_empty() {
                    slot.flushing = false;
                    None
                } else if slot.demand.is_zero() {
                    return;
                } else {
                    slot.demand.consume();
                    slot.tail.pop_front()
                }
            };
            let Some(item) = next else {
                self.fire_end();
                return;
            };
            let handler = self.handlers.lock().item.clone();
            if let Some(handler) = handler
                && let Err(e) = handler(item)
            {
                self.report(e);
            }
        }
    }

    fn fire_end(&self) {
        let handler = self.handlers.lock().end.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn close_upstream(&self) {
        let handler = self.handlers.lock().close.take();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn report(&self, error: StreamError) {
        let handler = self.handlers.lock().error.clone();
        match handler {
            Some(handler) => handler(error.with_context(format!("stage [{}]", self.name))),
            None => tracing::warn!(stage = %self.name, error = %error, "unhandled transform error"),
        }
    }
}

impl<T: Send + 'static> WriteStream<T> for AsyncTransformStage<T> {
    fn write(&self, item: T) -> Result<Ack, StreamError> {
        {
            let mut slot = self.slot.lock();
            if slot.closed || slot.finished {
                return Ok(ready_ack(Ok(())));
            }
            if slot.end_requested {
                return Err(StreamError::usage(format!("stage [{}]: write after end", self.name)));
            }
            if slot.in_flight {
                return Err(StreamError::usage(format!(
                    "stage [{}]: write while an item is in flight",
                    self.name
                )));
            }
            slot.in_flight = true;
        }

        let (tx, ack) = ack_channel();
        let future = self.transform.apply(item);
        let me = self.me.clone();
        self.ctx.spawn_async(future, move |result| match me.upgrade() {
            Some(stage) => stage.complete(result, tx),
            None => {
                let _ = tx.send(Err(StreamError::cancelled("stage dropped")));
            }
        });
        Ok(ack)
    }

    fn is_accepting_more(&self) -> bool {
        let slot = self.slot.lock();
        !(slot.in_flight || slot.end_requested || slot.finished || slot.closed)
    }

    fn set_drain_handler(&self, handler: DrainHandler) {
        self.handlers.lock().drain = Some(handler);
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        self.handlers.lock().close = Some(handler);
    }

    fn end(&self) -> Result<(), StreamError> {
        {
            let mut slot = self.slot.lock();
            if slot.closed || slot.finished {
                return Ok(());
            }
            if slot.end_requested {
                return Err(StreamError::usage(format!("stage [{}]: end called twice", self.name)));
            }
            slot.end_requested = true;
            if slot.in_flight {
                return Ok(());
            }
            slot.ended = true;
        }
        let me = self.me.clone();
        self.ctx.run_on_context(move || {
            if let Some(stage) = me.upgrade() {
                stage.end_stream();
            }
        });
        Ok(())
    }
}

impl<T: Send + 'static> ReadStream<T> for AsyncTransformStage<T> {
    fn set_item_handler(&self, handler: ItemHandler<T>) {
        self.handlers.lock().item = Some(handler);
    }

    fn set_end_handler(&self, handler: EndHandler) {
        self.handlers.lock().end = Some(handler);
    }

    fn set_error_handler(&self, handler: ErrorHandler) {
        self.handlers.lock().error = Some(handler);
    }

    fn pause(&self) {
        self.slot.lock().demand = Demand::default();
    }

    fn request_more(&self, n: i64) -> Result<(), StreamError> {
        let waiting = {
            let mut slot = self.slot.lock();
            slot.demand = slot.demand.request(n)?;
            slot.output.is_some() || !slot.tail.is_empty()
        };
        if waiting {
            let me = self.me.clone();
            self.ctx.run_on_context(move || {
                if let Some(stage) = me.upgrade() {
                    stage.emit();
                    stage.emit_tail();
                }
            });
        }
        Ok(())
    }

    fn close(&self) {
        let ack = {
            let mut slot = self.slot.lock();
            if slot.closed {
                return;
            }
            slot.closed = true;
            slot.output = None;
            slot.tail.clear();
            slot.flushing = false;
            slot.ack.take()
        };
        if let Some(ack) = ack {
            let _ = ack.send(Err(StreamError::cancelled(format!("stage [{}] closed", self.name))));
        }
        tracing::debug!(stage = %self.name, "stage closed");
        self.close_upstream();
        let mut handlers = self.handlers.lock();
        handlers.item = None;
        handlers.end = None;
        handlers.drain = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_source::BoundedDemandSource;
    use crate::pipe::pipe;
    use futures::FutureExt;
    use query_api::{ErrorKind, Row, Schema, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn eventually(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn collect<T: Send + 'static>(stage: &AsyncTransformStage<T>) -> (Arc<Mutex<Vec<T>>>, Arc<Mutex<u32>>) {
        let items = Arc::new(Mutex::new(Vec::new()));
        let ends = Arc::new(Mutex::new(0));
        let sink = items.clone();
        stage.set_item_handler(Arc::new(move |v| {
            sink.lock().push(v);
            Ok(())
        }));
        let counter = ends.clone();
        stage.set_end_handler(Arc::new(move || *counter.lock() += 1));
        (items, ends)
    }

    fn doubling() -> Arc<dyn Transform<Row>> {
        Arc::new(|row: Row| -> TransformFuture<Row> {
            async move {
                let v = row.get("v").and_then(Value::as_i64).unwrap_or(0);
                let schema = row.schema().clone();
                Ok(Transformed::Emit(Row::new(schema).with("v", v * 2)?))
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn doubles_rows_in_order() {
        let ctx = ExecutionContext::new("test");
        let schema = Arc::new(Schema::new());
        let source = BoundedDemandSource::new(ctx.clone(), 2, schema.clone()).unwrap();
        let stage = AsyncTransformStage::new(ctx.clone(), "double", doubling());
        let (items, ends) = collect(&stage);
        stage.resume();
        pipe(source.clone(), stage.clone());

        let producer = source.clone();
        tokio::task::spawn_blocking(move || {
            for v in [1i64, 2, 3] {
                producer.add(Row::new(schema.clone()).with("v", v).unwrap()).unwrap();
            }
            producer.end().unwrap();
        });

        eventually(|| *ends.lock() == 1).await;
        let out: Vec<i64> = items.lock().iter().filter_map(|r| r.get("v").and_then(Value::as_i64)).collect();
        assert_eq!(out, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn write_while_in_flight_is_rejected() {
        let ctx = ExecutionContext::new("test");
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(Mutex::new(Some(release_rx)));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        let transform: Arc<dyn Transform<i32>> = Arc::new(move |v: i32| -> TransformFuture<i32> {
            let gate = release_rx.lock().take();
            let (r, p) = (r.clone(), p.clone());
            async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                if let Some(gate) = gate {
                    let _ = gate.await;
                }
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(Transformed::Emit(v))
            }
            .boxed()
        });
        let stage = AsyncTransformStage::new(ctx.clone(), "gated", transform);
        let (items, _) = collect(&stage);
        stage.resume();

        let first = stage.write(1).unwrap();
        assert!(!stage.is_accepting_more());
        let err = stage.write(2).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Usage);

        release_tx.send(()).unwrap();
        first.await.unwrap();
        eventually(|| stage.is_accepting_more()).await;
        stage.write(3).unwrap().await.unwrap();

        assert_eq!(*items.lock(), vec![1, 3]);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_items_reduce_downstream_count() {
        let ctx = ExecutionContext::new("test");
        let schema = Arc::new(Schema::new());
        let source = BoundedDemandSource::new(ctx.clone(), 4, schema).unwrap();
        let evens: Arc<dyn Transform<i32>> = Arc::new(|v: i32| -> TransformFuture<i32> {
            async move { Ok(if v % 2 == 0 { Transformed::Emit(v) } else { Transformed::Skip }) }.boxed()
        });
        let stage = AsyncTransformStage::new(ctx.clone(), "evens", evens);
        let (items, ends) = collect(&stage);
        stage.resume();
        pipe(source.clone(), stage.clone());

        let producer = source.clone();
        tokio::task::spawn_blocking(move || {
            for v in 0..20 {
                producer.add(v).unwrap();
            }
            producer.end().unwrap();
        });

        eventually(|| *ends.lock() == 1).await;
        assert_eq!(items.lock().len(), 20 - 10);
    }

    #[tokio::test]
    async fn fault_frees_slot_and_reports() {
        let ctx = ExecutionContext::new("test");
        let failing: Arc<dyn Transform<i32>> = Arc::new(|v: i32| -> TransformFuture<i32> {
            async move {
                if v == 1 { Err(StreamError::transform("bad row")) } else { Ok(Transformed::Emit(v)) }
            }
            .boxed()
        });
        let stage = AsyncTransformStage::new(ctx.clone(), "failing", failing);
        let (items, _) = collect(&stage);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let drains = Arc::new(Mutex::new(0));
        let errs = errors.clone();
        stage.set_error_handler(Arc::new(move |e| errs.lock().push(e)));
        let counter = drains.clone();
        stage.set_drain_handler(Arc::new(move || *counter.lock() += 1));
        stage.resume();

        let err = stage.write(1).unwrap().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transform);
        eventually(|| *drains.lock() == 1).await;
        assert!(stage.is_accepting_more());
        stage.write(2).unwrap().await.unwrap();
        assert_eq!(*items.lock(), vec![2]);
        assert_eq!(errors.lock().len(), 1);
    }

    #[tokio::test]
    async fn output_waits_for_downstream_demand() {
        let ctx = ExecutionContext::new("test");
        let identity: Arc<dyn Transform<i32>> = Arc::new(|v: i32| -> TransformFuture<i32> { async move { Ok(Transformed::Emit(v)) }.boxed() });
        let stage = AsyncTransformStage::new(ctx.clone(), "identity", identity);
        let (items, ends) = collect(&stage);

        let ack = stage.write(7).unwrap();
        stage.end().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.flush().await;
        assert!(items.lock().is_empty());
        assert!(!stage.is_accepting_more());
        assert_eq!(*ends.lock(), 0);

        stage.request_more(1).unwrap();
        ack.await.unwrap();
        eventually(|| *ends.lock() == 1).await;
        assert_eq!(*items.lock(), vec![7]);
    }

    #[tokio::test]
    async fn end_when_idle_propagates_immediately() {
        let ctx = ExecutionContext::new("test");
        let identity: Arc<dyn Transform<i32>> = Arc::new(|v: i32| -> TransformFuture<i32> { async move { Ok(Transformed::Emit(v)) }.boxed() });
        let stage = AsyncTransformStage::new(ctx.clone(), "identity", identity);
        let (_, ends) = collect(&stage);
        stage.end().unwrap();
        ctx.flush().await;
        assert_eq!(*ends.lock(), 1);
        assert_eq!(stage.end().unwrap_err().kind(), ErrorKind::Usage);
    }

    struct Reverse {
        held: Mutex<Vec<i32>>,
    }

    impl Transform<i32> for Reverse {
        fn apply(&self, v: i32) -> TransformFuture<i32> {
            self.held.lock().push(v);
            async { Ok(Transformed::Skip) }.boxed()
        }

        fn flush(&self) -> Option<FlushFuture<i32>> {
            let mut held = std::mem::take(&mut *self.held.lock());
            held.reverse();
            Some(async move { Ok(held) }.boxed())
        }
    }

    #[tokio::test]
    async fn held_items_are_released_at_end_within_demand() {
        let ctx = ExecutionContext::new("test");
        let stage = AsyncTransformStage::new(ctx.clone(), "reverse", Arc::new(Reverse { held: Mutex::new(Vec::new()) }));
        let (items, ends) = collect(&stage);

        for v in [1, 2, 3] {
            stage.write(v).unwrap().await.unwrap();
            eventually(|| stage.is_accepting_more()).await;
        }
        stage.end().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.flush().await;
        assert!(items.lock().is_empty());
        assert_eq!(*ends.lock(), 0);

        stage.request_more(2).unwrap();
        eventually(|| items.lock().len() == 2).await;
        ctx.flush().await;
        assert_eq!(*items.lock(), vec![3, 2]);
        assert_eq!(*ends.lock(), 0);

        stage.request_more(1).unwrap();
        eventually(|| *ends.lock() == 1).await;
        assert_eq!(*items.lock(), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn close_discards_in_flight_result() {
        let ctx = ExecutionContext::new("test");
        let slow: Arc<dyn Transform<i32>> = Arc::new(|v: i32| -> TransformFuture<i32> {
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Transformed::Emit(v))
            }
            .boxed()
        });
        let stage = AsyncTransformStage::new(ctx.clone(), "slow", slow);
        let (items, _) = collect(&stage);
        let upstream_closed = Arc::new(Mutex::new(false));
        let flag = upstream_closed.clone();
        stage.set_close_handler(Arc::new(move || *flag.lock() = true));
        stage.resume();

        let ack = stage.write(1).unwrap();
        stage.close();
        assert!(*upstream_closed.lock());
        assert_eq!(ack.await.unwrap_err().kind(), ErrorKind::Cancelled);
        assert!(items.lock().is_empty());
        assert!(stage.write(2).is_ok());
    }
}
