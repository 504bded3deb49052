use std::any::Any;
use std::fmt::{self, Display, Formatter};
use std::io::Write;
use std::sync::Arc;

use crate::config::SinkKind;
use crate::stack::{self, StackFrame};

/// Diagnostic record for one recovered panic.
#[derive(Debug, Clone)]
pub struct FaultReport {
    /// Request line and headers, no body.
    pub request_dump: Vec<u8>,
    pub raw_body: String,
    pub fault_value: String,
    /// `file:line:column` of the panic, when the hook saw it.
    pub location: Option<String>,
    pub stack: Vec<StackFrame>,
}

impl FaultReport {
    pub fn request_text(&self) -> String {
        String::from_utf8_lossy(&self.request_dump).into_owned()
    }

    pub fn stack_text(&self) -> String {
        String::from_utf8_lossy(&stack::write_frames(&self.stack)).into_owned()
    }
}

impl Display for FaultReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[Recovery] panic recovered:\n{}\n{}\n{}\n{}\n",
            self.request_text(),
            self.raw_body,
            self.fault_value,
            self.stack_text()
        )
    }
}

/// Turns a `catch_unwind` payload into something printable.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        // panic_any with a custom payload
        "Box<dyn Any>".to_string()
    }
}

/// Destination for fault reports.
///
/// Sinks are shared by every request and may be called from several threads
/// at once; each call must write its report as one unit.
pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, report: &FaultReport);
}

impl<F> DiagnosticSink for F
where
    F: Fn(&FaultReport) + Send + Sync,
{
    fn emit(&self, report: &FaultReport) {
        self(report)
    }
}

/// Emits each report as a single `tracing` error event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, report: &FaultReport) {
        tracing::error!(
            request = %report.request_text(),
            raw_body = %report.raw_body,
            panic.message = %report.fault_value,
            panic.location = report.location.as_deref(),
            stack = %report.stack_text(),
            "panic recovered"
        );
    }
}

/// Prints the report to stdout in one write.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutSink;

impl DiagnosticSink for StdoutSink {
    fn emit(&self, report: &FaultReport) {
        let text = report.to_string();
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

impl SinkKind {
    pub fn build(self) -> Arc<dyn DiagnosticSink> {
        match self {
            SinkKind::Tracing => Arc::new(TracingSink),
            SinkKind::Stdout => Arc::new(StdoutSink),
        }
    }
}
