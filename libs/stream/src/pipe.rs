use std::sync::Arc;

use crate::stream::{ReadStream, WriteStream};

/// Connect `source` to `sink` and start the flow.
///
/// Items go to `sink.write`; when the sink stops accepting, the source is
/// paused until the sink's drain handler resumes it. End is forwarded
/// downstream and a sink close is forwarded upstream. Write faults surface
/// through the source's error handler. The sink only holds a weak reference
/// to the source, so the graph has no reference cycles.
pub fn pipe<T: Send + 'static>(source: Arc<dyn ReadStream<T>>, sink: Arc<dyn WriteStream<T>>) {
    let upstream = Arc::downgrade(&source);

    let target = sink.clone();
    let paused = upstream.clone();
    source.set_item_handler(Arc::new(move |item| {
        let _ack = target.write(item)?;
        if !target.is_accepting_more()
            && let Some(source) = paused.upgrade()
        {
            source.pause();
        }
        Ok(())
    }));

    let target = sink.clone();
    source.set_end_handler(Arc::new(move || {
        if let Err(e) = target.end() {
            tracing::error!(error = %e, "failed to forward end downstream");
        }
    }));

    let resumed = upstream.clone();
    sink.set_drain_handler(Arc::new(move || {
        if let Some(source) = resumed.upgrade() {
            source.resume();
        }
    }));

    sink.set_close_handler(Arc::new(move || {
        if let Some(source) = upstream.upgrade() {
            source.close();
        }
    }));

    source.resume();
}
