pub mod api;
pub mod config;
pub mod guard;
pub mod hook;
pub mod report;
pub mod request;
pub mod stack;
pub mod system;
pub mod trace;

pub use guard::{Recovery, RecoveryLayer};
pub use report::{DiagnosticSink, FaultReport};
