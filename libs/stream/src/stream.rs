use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

use query_api::StreamError;

/// Receives each delivered item. An `Err` is routed to the error handler
/// of the delivering stream; delivery continues with the next item.
pub type ItemHandler<T> = Arc<dyn Fn(T) -> Result<(), StreamError> + Send + Sync>;
pub type EndHandler = Arc<dyn Fn() + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(StreamError) + Send + Sync>;
/// Fired by a write side once it accepts items again, and by a
/// [`BoundedDemandSource`](crate::BoundedDemandSource) when demand ran out
/// with items still queued.
pub type DrainHandler = Arc<dyn Fn() + Send + Sync>;
/// Fired by a write side when it will accept nothing more, so the upstream
/// can stop producing.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// Acknowledgement of one written item.
pub type Ack = BoxFuture<'static, Result<(), StreamError>>;

pub(crate) fn ack_channel() -> (oneshot::Sender<Result<(), StreamError>>, Ack) {
    let (tx, rx) = oneshot::channel();
    let ack = async move {
        rx.await
            .unwrap_or_else(|_| Err(StreamError::cancelled("stage closed before acknowledging")))
    }
    .boxed();
    (tx, ack)
}

pub(crate) fn ready_ack(result: Result<(), StreamError>) -> Ack {
    futures::future::ready(result).boxed()
}

/// Demand-driven read side shared by every stage.
///
/// Nothing is delivered before the consumer grants demand. Handlers run on
/// the owning [`ExecutionContext`](crate::ExecutionContext).
pub trait ReadStream<T>: Send + Sync {
    fn set_item_handler(&self, handler: ItemHandler<T>);
    fn set_end_handler(&self, handler: EndHandler);
    fn set_error_handler(&self, handler: ErrorHandler);

    /// Drop all outstanding demand.
    fn pause(&self);

    /// Grant unlimited demand.
    fn resume(&self) {
        let _ = self.request_more(i64::MAX);
    }

    /// Grant `n` more items. Negative `n` is a usage fault.
    fn request_more(&self, n: i64) -> Result<(), StreamError>;

    /// Stop delivering and release resources. Idempotent.
    fn close(&self);
}

/// Write side shared by every non-source stage.
pub trait WriteStream<T>: Send + Sync {
    /// Hand one item over. Writing while `is_accepting_more()` is false is
    /// a usage fault.
    fn write(&self, item: T) -> Result<Ack, StreamError>;

    fn is_accepting_more(&self) -> bool;

    fn set_drain_handler(&self, handler: DrainHandler);

    fn set_close_handler(&self, handler: CloseHandler);

    /// No more items will follow. Calling it twice is a usage fault.
    fn end(&self) -> Result<(), StreamError>;
}
