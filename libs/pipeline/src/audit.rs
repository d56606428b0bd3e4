use std::collections::BTreeMap;

use parking_lot::Mutex;

use query_api::{Arguments, Auditor};

/// Audit trail of one run as kept by [`MemoryAuditor`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditRecord {
    pub pipeline: String,
    pub arguments: Arguments,
    pub sources: Vec<String>,
    pub rows_written: Option<u64>,
    pub completed: Option<u64>,
    pub failure: Option<(u16, String)>,
}

/// Keeps every record in memory, keyed by run id.
#[derive(Default)]
pub struct MemoryAuditor {
    records: Mutex<BTreeMap<String, AuditRecord>>,
}

impl MemoryAuditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, run_id: &str) -> Option<AuditRecord> {
        self.records.lock().get(run_id).cloned()
    }

    pub fn records(&self) -> Vec<(String, AuditRecord)> {
        self.records.lock().iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn update(&self, run_id: &str, f: impl FnOnce(&mut AuditRecord)) {
        f(self.records.lock().entry(run_id.to_string()).or_default());
    }
}

impl Auditor for MemoryAuditor {
    fn record_request(&self, run_id: &str, pipeline: &str, arguments: &Arguments) {
        self.update(run_id, |r| {
            r.pipeline = pipeline.to_string();
            r.arguments = arguments.clone();
        });
    }

    fn record_source(&self, run_id: &str, source: &str) {
        self.update(run_id, |r| r.sources.push(source.to_string()));
    }

    fn record_rows_written(&self, run_id: &str, rows: u64) {
        self.update(run_id, |r| r.rows_written = Some(rows));
    }

    fn record_completion(&self, run_id: &str, rows: u64) {
        self.update(run_id, |r| r.completed = Some(rows));
    }

    fn record_failure(&self, run_id: &str, status: u16, message: &str) {
        self.update(run_id, |r| r.failure = Some((status, message.to_string())));
    }
}

/// Writes the audit trail to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditor;

impl Auditor for TracingAuditor {
    fn record_request(&self, run_id: &str, pipeline: &str, arguments: &Arguments) {
        let arguments: Vec<&str> = arguments.iter().map(|(name, _)| name).collect();
        tracing::info!(run_id, pipeline, ?arguments, "pipeline requested");
    }

    fn record_source(&self, run_id: &str, source: &str) {
        tracing::info!(run_id, source, "source opened");
    }

    fn record_rows_written(&self, run_id: &str, rows: u64) {
        tracing::debug!(run_id, rows, "rows written");
    }

    fn record_completion(&self, run_id: &str, rows: u64) {
        tracing::info!(run_id, rows, "pipeline completed");
    }

    fn record_failure(&self, run_id: &str, status: u16, message: &str) {
        tracing::error!(run_id, status, error = message, "pipeline failed");
    }
}
