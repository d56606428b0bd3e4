pub mod bounded_source;
pub mod context;
pub mod demand;
pub mod formatting_sink;
pub mod pipe;
pub mod plugin;
pub mod stream;
pub mod transform_stage;

pub use bounded_source::{BoundedDemandSource, StreamState};
pub use context::ExecutionContext;
pub use demand::Demand;
pub use formatting_sink::{EncodedOutput, FormatCallbacks, FormattingSink, RowCapture};
pub use pipe::pipe;
pub use plugin::{Processor, ProcessorOutput, Source, SourceContext, SourceStream};
pub use stream::{
    Ack, CloseHandler, DrainHandler, EndHandler, ErrorHandler, ItemHandler, ReadStream, WriteStream,
};
pub use transform_stage::{AsyncTransformStage, FlushFuture, Transform, TransformFuture, Transformed};
