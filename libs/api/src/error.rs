use std::fmt;

/// Category of a stream error. Decides whether a fault is reported and
/// skipped or fails the whole pipeline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Programmer error: misordered calls, negative demand, write while busy.
    Usage,
    /// Per-row failure inside a transform. The row is dropped.
    Transform,
    /// A processor explicitly fails the stream.
    Abort,
    /// Source initialization or mid-stream failure.
    Source,
    /// The output byte sink failed (disk full, client gone).
    Encoding,
    /// Value does not match the declared column type.
    Schema,
    /// Invalid definition, argument or request.
    Config,
    /// The graph was closed before the operation completed.
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Usage => "usage",
            ErrorKind::Transform => "transform",
            ErrorKind::Abort => "abort",
            ErrorKind::Source => "source",
            ErrorKind::Encoding => "encoding",
            ErrorKind::Schema => "schema",
            ErrorKind::Config => "config",
            ErrorKind::Cancelled => "cancelled",
        })
    }
}

/// Error raised by every stage of a pipeline.
///
/// Cloneable so the same fault can resolve an acknowledgement and reach
/// an error handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    kind: ErrorKind,
    message: String,
}

impl StreamError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, message: msg.into() }
    }

    pub fn usage(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Usage, msg)
    }

    pub fn transform(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transform, msg)
    }

    pub fn abort(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Abort, msg)
    }

    pub fn source(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Source, msg)
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Encoding, msg)
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Schema, msg)
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Everything except a per-row transform fault fails the pipeline.
    pub fn is_fatal(&self) -> bool {
        self.kind != ErrorKind::Transform
    }

    /// Add context to the error, preserving its ErrorKind.
    ///
    /// Produces: `"context: message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for StreamError {}

// ---------------------------------------------------------------------------
// From impls: output side failures surface as encoding errors
// ---------------------------------------------------------------------------

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        Self::encoding(e.to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        Self::encoding(e.to_string())
    }
}
