use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;

use query_api::{Auditor, Column, Row, RowEncoder, Schema, StreamError};

use crate::context::ExecutionContext;
use crate::stream::{Ack, CloseHandler, DrainHandler, WriteStream, ack_channel, ready_ack};

/// Framing callbacks driven by a [`FormattingSink`].
///
/// `on_open` runs once before the first row, `on_row` once per data row in
/// order, `on_close` exactly once after the last acknowledged row.
pub trait FormatCallbacks: Send + 'static {
    fn on_open(&mut self) -> BoxFuture<'_, Result<(), StreamError>>;
    fn on_row(&mut self, row: Row) -> BoxFuture<'_, Result<(), StreamError>>;
    fn on_close(&mut self, row_count: u64) -> BoxFuture<'_, Result<(), StreamError>>;
}

type SharedCallbacks = Arc<tokio::sync::Mutex<Box<dyn FormatCallbacks>>>;

struct SinkState {
    opened: bool,
    in_flight: bool,
    rows: u64,
    end_requested: bool,
    aborted: bool,
    closing: bool,
    failure: Option<StreamError>,
    completion: Option<oneshot::Sender<Result<u64, StreamError>>>,
}

#[derive(Default)]
struct SinkHandlers {
    drain: Option<DrainHandler>,
    close: Option<CloseHandler>,
}

/// Terminal stage turning rows into framed output.
///
/// While `on_row` is pending the sink refuses further rows, which stalls
/// upstream without an extra buffer. Sentinel rows produce nothing and are
/// not counted. On failure the close path still runs so partial output is
/// well-formed, and [`completion`](Self::completion) resolves with the
/// failure.
pub struct FormattingSink {
    ctx: ExecutionContext,
    callbacks: SharedCallbacks,
    state: Mutex<SinkState>,
    handlers: Mutex<SinkHandlers>,
    completion: Mutex<Option<oneshot::Receiver<Result<u64, StreamError>>>>,
    me: Weak<Self>,
}

impl FormattingSink {
    pub fn new(ctx: ExecutionContext, callbacks: Box<dyn FormatCallbacks>) -> Arc<Self> {
        let (tx, rx) = oneshot::channel();
        Arc::new_cyclic(|me| Self {
            ctx,
            callbacks: Arc::new(tokio::sync::Mutex::new(callbacks)),
            state: Mutex::new(SinkState {
                opened: false,
                in_flight: false,
                rows: 0,
                end_requested: false,
                aborted: false,
                closing: false,
                failure: None,
                completion: Some(tx),
            }),
            handlers: Mutex::new(SinkHandlers::default()),
            completion: Mutex::new(Some(rx)),
            me: me.clone(),
        })
    }

    pub fn rows_written(&self) -> u64 {
        self.state.lock().rows
    }

    /// Resolves with the final row count, or the failure that stopped the
    /// sink. Can be taken once.
    pub fn completion(&self) -> BoxFuture<'static, Result<u64, StreamError>> {
        let rx = self.completion.lock().take();
        async move {
            match rx {
                Some(rx) => rx
                    .await
                    .unwrap_or_else(|_| Err(StreamError::cancelled("sink dropped before completing"))),
                None => Err(StreamError::usage("sink completion already taken")),
            }
        }
        .boxed()
    }

    /// Fail the sink: the in-flight row finishes, the close path still runs,
    /// upstream is told to close and completion resolves with `error`.
    pub fn abort(&self, error: StreamError) {
        let start = {
            let mut state = self.state.lock();
            if state.failure.is_none() {
                state.failure = Some(error);
            }
            if state.aborted {
                return;
            }
            state.aborted = true;
            !state.in_flight && !state.closing
        };
        tracing::debug!(context = %self.ctx.name(), "sink aborted");
        if start {
            self.start_close();
        }
        self.close_upstream();
    }

    fn row_done(&self, result: Result<(), StreamError>, ack: oneshot::Sender<Result<(), StreamError>>) {
        let (failed, close_now) = {
            let mut state = self.state.lock();
            state.in_flight = false;
            let failed = match &result {
                Ok(()) => {
                    state.rows += 1;
                    false
                }
                Err(e) => {
                    if state.failure.is_none() {
                        state.failure = Some(e.clone());
                    }
                    state.aborted = true;
                    true
                }
            };
            let close_now = (state.end_requested || state.aborted) && !state.closing;
            (failed, close_now)
        };
        let _ = ack.send(result);

        if close_now {
            self.start_close();
        }
        if failed {
            self.close_upstream();
        } else if !close_now {
            let handler = self.handlers.lock().drain.clone();
            if let Some(handler) = handler {
                handler();
            }
        }
    }

    fn start_close(&self) {
        let (open_first, rows) = {
            let mut state = self.state.lock();
            if state.closing {
                return;
            }
            state.closing = true;
            let open_first = !state.opened;
            state.opened = true;
            (open_first, state.rows)
        };

        let callbacks = self.callbacks.clone();
        let future = async move {
            let mut callbacks = callbacks.lock_owned().await;
            if open_first {
                callbacks.on_open().await?;
            }
            callbacks.on_close(rows).await
        };
        let me = self.me.clone();
        self.ctx.spawn_async(future, move |result| {
            if let Some(sink) = me.upgrade() {
                sink.closed(result);
            }
        });
    }

    fn closed(&self, result: Result<(), StreamError>) {
        let (sender, outcome) = {
            let mut state = self.state.lock();
            let outcome = match (state.failure.take(), result) {
                (Some(failure), _) => Err(failure),
                (None, Err(e)) => Err(e),
                (None, Ok(())) => Ok(state.rows),
            };
            (state.completion.take(), outcome)
        };
        match &outcome {
            Ok(rows) => tracing::debug!(context = %self.ctx.name(), rows, "sink closed"),
            Err(e) => tracing::debug!(context = %self.ctx.name(), error = %e, "sink closed after failure"),
        }
        if let Some(sender) = sender {
            let _ = sender.send(outcome);
        }
    }

    fn close_upstream(&self) {
        let handler = self.handlers.lock().close.take();
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl WriteStream<Row> for FormattingSink {
    fn write(&self, row: Row) -> Result<Ack, StreamError> {
        let open_first = {
            let mut state = self.state.lock();
            if state.aborted || state.closing {
                return Ok(ready_ack(Err(StreamError::cancelled("sink is closing"))));
            }
            if state.end_requested {
                return Err(StreamError::usage("sink: write after end"));
            }
            if state.in_flight {
                return Err(StreamError::usage("sink: write while a row is being written"));
            }
            if row.is_sentinel() {
                return Ok(ready_ack(Ok(())));
            }
            state.in_flight = true;
            let open_first = !state.opened;
            state.opened = true;
            open_first
        };

        let (tx, ack) = ack_channel();
        let callbacks = self.callbacks.clone();
        let future = async move {
            let mut callbacks = callbacks.lock_owned().await;
            if open_first {
                callbacks.on_open().await?;
            }
            callbacks.on_row(row).await
        };
        let me = self.me.clone();
        self.ctx.spawn_async(future, move |result| match me.upgrade() {
            Some(sink) => sink.row_done(result, tx),
            None => {
                let _ = tx.send(Err(StreamError::cancelled("sink dropped")));
            }
        });
        Ok(ack)
    }

    fn is_accepting_more(&self) -> bool {
        let state = self.state.lock();
        !(state.in_flight || state.end_requested || state.aborted || state.closing)
    }

    fn set_drain_handler(&self, handler: DrainHandler) {
        self.handlers.lock().drain = Some(handler);
    }

    fn set_close_handler(&self, handler: CloseHandler) {
        self.handlers.lock().close = Some(handler);
    }

    fn end(&self) -> Result<(), StreamError> {
        {
            let mut state = self.state.lock();
            if state.aborted {
                return Ok(());
            }
            if state.end_requested {
                return Err(StreamError::usage("sink: end called twice"));
            }
            state.end_requested = true;
            if state.in_flight {
                return Ok(());
            }
        }
        self.start_close();
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  EncodedOutput — RowEncoder over an async byte sink
// ═══════════════════════════════════════════════════════════════

/// Standard [`FormatCallbacks`]: encodes rows with a [`RowEncoder`] into an
/// async byte sink and reports the final count to the auditor.
///
/// The header is written lazily with the first row, since the schema may
/// still grow until then. A stream without rows gets the header at close.
pub struct EncodedOutput<W> {
    encoder: Box<dyn RowEncoder>,
    output: W,
    schema: Arc<Schema>,
    header: Option<Vec<Column>>,
    auditor: Arc<dyn Auditor>,
    run_id: String,
    buffer: Vec<u8>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> EncodedOutput<W> {
    pub fn new(
        encoder: Box<dyn RowEncoder>,
        output: W,
        schema: Arc<Schema>,
        auditor: Arc<dyn Auditor>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            encoder,
            output,
            schema,
            header: None,
            auditor,
            run_id: run_id.into(),
            buffer: Vec::with_capacity(8192),
        }
    }

    fn ensure_header(&mut self, schema: &Schema) -> Result<(), StreamError> {
        if self.header.is_none() {
            let columns = schema.columns();
            self.encoder.header(&columns, &mut self.buffer)?;
            self.header = Some(columns);
        }
        Ok(())
    }

    async fn flush_buffer(&mut self) -> Result<(), StreamError> {
        if !self.buffer.is_empty() {
            self.output.write_all(&self.buffer).await?;
            self.buffer.clear();
        }
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin + Send + 'static> FormatCallbacks for EncodedOutput<W> {
    fn on_open(&mut self) -> BoxFuture<'_, Result<(), StreamError>> {
        async move {
            self.encoder.open(&mut self.buffer)?;
            self.flush_buffer().await
        }
        .boxed()
    }

    fn on_row(&mut self, row: Row) -> BoxFuture<'_, Result<(), StreamError>> {
        async move {
            let schema = row.schema().clone();
            self.ensure_header(&schema)?;
            let columns = self.header.as_deref().unwrap_or_default();
            self.encoder.row(columns, &row, &mut self.buffer)?;
            self.flush_buffer().await
        }
        .boxed()
    }

    fn on_close(&mut self, row_count: u64) -> BoxFuture<'_, Result<(), StreamError>> {
        async move {
            let schema = self.schema.clone();
            self.ensure_header(&schema)?;
            self.encoder.close(row_count, &mut self.buffer)?;
            self.flush_buffer().await?;
            self.output.shutdown().await?;
            self.auditor.record_rows_written(&self.run_id, row_count);
            Ok(())
        }
        .boxed()
    }
}

// ═══════════════════════════════════════════════════════════════
//  RowCapture — collects rows in memory
// ═══════════════════════════════════════════════════════════════

/// [`FormatCallbacks`] that keeps every row, for side streams whose rows
/// are consumed by the engine itself.
#[derive(Clone, Default)]
pub struct RowCapture {
    rows: Arc<Mutex<Vec<Row>>>,
}

impl RowCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Row> {
        std::mem::take(&mut *self.rows.lock())
    }
}

impl FormatCallbacks for RowCapture {
    fn on_open(&mut self) -> BoxFuture<'_, Result<(), StreamError>> {
        futures::future::ready(Ok(())).boxed()
    }

    fn on_row(&mut self, row: Row) -> BoxFuture<'_, Result<(), StreamError>> {
        self.rows.lock().push(row);
        futures::future::ready(Ok(())).boxed()
    }

    fn on_close(&mut self, _row_count: u64) -> BoxFuture<'_, Result<(), StreamError>> {
        futures::future::ready(Ok(())).boxed()
    }
}
