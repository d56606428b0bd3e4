use crate::error::StreamError;
use crate::row::Row;
use crate::schema::Column;

/// Byte-level encoder of one output format.
///
/// Each method appends to `out`; the caller owns the actual byte sink and
/// its backpressure. Call order: `open`, `header` once, `row` per row,
/// `close` once.
pub trait RowEncoder: Send {
    /// Preamble written before anything else.
    fn open(&mut self, _out: &mut Vec<u8>) -> Result<(), StreamError> {
        Ok(())
    }

    /// Schema-dependent header, written before the first row or at close
    /// when the stream carried no rows.
    fn header(&mut self, _columns: &[Column], _out: &mut Vec<u8>) -> Result<(), StreamError> {
        Ok(())
    }

    fn row(&mut self, columns: &[Column], row: &Row, out: &mut Vec<u8>) -> Result<(), StreamError>;

    fn close(&mut self, _row_count: u64, _out: &mut Vec<u8>) -> Result<(), StreamError> {
        Ok(())
    }
}
