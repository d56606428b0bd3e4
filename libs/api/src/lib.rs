pub mod args;
pub mod audit;
pub mod endpoint;
pub mod error;
pub mod format;
pub mod row;
pub mod schema;
pub mod script;
pub mod value;

pub use args::Arguments;
pub use audit::{Auditor, NoopAuditor};
pub use endpoint::{Endpoint, EndpointKind, Endpoints};
pub use error::{ErrorKind, StreamError};
pub use format::RowEncoder;
pub use row::Row;
pub use schema::{Column, Schema};
pub use script::{Expression, ScriptEngine};
pub use value::{DataType, Value};
