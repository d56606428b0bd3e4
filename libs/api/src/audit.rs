use crate::args::Arguments;

/// Collects the audit record of a pipeline run.
pub trait Auditor: Send + Sync {
    fn record_request(&self, run_id: &str, pipeline: &str, arguments: &Arguments);
    fn record_source(&self, run_id: &str, source: &str);
    fn record_rows_written(&self, run_id: &str, rows: u64);
    fn record_completion(&self, run_id: &str, rows: u64);
    fn record_failure(&self, run_id: &str, status: u16, message: &str);
}

/// Auditor that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditor;

impl Auditor for NoopAuditor {
    fn record_request(&self, _run_id: &str, _pipeline: &str, _arguments: &Arguments) {}
    fn record_source(&self, _run_id: &str, _source: &str) {}
    fn record_rows_written(&self, _run_id: &str, _rows: u64) {}
    fn record_completion(&self, _run_id: &str, _rows: u64) {}
    fn record_failure(&self, _run_id: &str, _status: u16, _message: &str) {}
}
