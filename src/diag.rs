//! Diagnostics sink
//!
//! The runner reports failures through an injected collaborator instead of
//! logging from free functions, so embedders decide where the records go.
//! Sinks are observational only and must never affect control flow.

use std::sync::{Arc, Mutex};

/// Receives human-readable records from the runner.
pub trait DiagnosticsSink {
    /// A failure worth operator attention: faults, construction errors,
    /// malformed traffic.
    fn failure(&self, detail: &str);

    /// Session events that are normal but notable, such as the peer
    /// disconnecting.
    fn notice(&self, detail: &str);
}

/// Default sink forwarding to the `tracing` ecosystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticsSink for LogSink {
    fn failure(&self, detail: &str) {
        tracing::error!(target: "plugbay", "{detail}");
    }

    fn notice(&self, detail: &str) {
        tracing::info!(target: "plugbay", "{detail}");
    }
}

/// Collects records in memory. Clones share the same buffer, so a test can
/// keep one handle while the runner owns another.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<String> {
        self.records.lock().unwrap().clone()
    }
}

impl DiagnosticsSink for MemorySink {
    fn failure(&self, detail: &str) {
        self.records.lock().unwrap().push(format!("failure: {detail}"));
    }

    fn notice(&self, detail: &str) {
        self.records.lock().unwrap().push(format!("notice: {detail}"));
    }
}
