//! Pluggable logging seam.
//!
//! Embedders that already route diagnostics elsewhere implement [`Logger`];
//! everyone else gets [`TracingLogger`], which forwards to the `tracing`
//! ecosystem and picks up whatever subscriber the host process installed.

pub trait Logger: Send + Sync {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
    fn fatal(&self, message: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, message: &str) {
        tracing::debug!(target: "gametap", "{message}");
    }

    fn info(&self, message: &str) {
        tracing::info!(target: "gametap", "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "gametap", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "gametap", "{message}");
    }

    fn fatal(&self, message: &str) {
        tracing::error!(target: "gametap", fatal = true, "{message}");
    }
}
