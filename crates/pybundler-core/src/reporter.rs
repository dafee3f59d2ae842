//! Reporter trait for dependency injection
//!
//! This trait allows the build pipeline to report progress and status without
//! being coupled to a specific terminal front end.

pub trait Reporter: Send + Sync {
    /// Indicates a new stage has started (e.g. "Discovering modules", "Relocating").
    fn section(&self, title: &str);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a success message.
    fn success(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);

    /// Log an error message.
    fn error(&self, msg: &str);

    /// Display a final summary of the build.
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn section(&self, title: &str) {
        (**self).section(title);
    }
    fn info(&self, msg: &str) {
        (**self).info(msg);
    }
    fn success(&self, msg: &str) {
        (**self).success(msg);
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg);
    }
    fn error(&self, msg: &str) {
        (**self).error(msg);
    }
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        (**self).summary(count, action, elapsed_secs);
    }
}

/// A no-op reporter for silent operations (e.g., testing).
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn section(&self, _: &str) {}
    fn info(&self, _: &str) {}
    fn success(&self, _: &str) {}
    fn warning(&self, _: &str) {}
    fn error(&self, _: &str) {}
    fn summary(&self, _: usize, _: &str, _: f64) {}
}

/// Forwards everything to `tracing`, so `RUST_LOG` controls what is shown.
#[derive(Debug, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn section(&self, title: &str) {
        tracing::info!("==> {title}");
    }
    fn info(&self, msg: &str) {
        tracing::info!("{msg}");
    }
    fn success(&self, msg: &str) {
        tracing::info!("ok: {msg}");
    }
    fn warning(&self, msg: &str) {
        tracing::warn!("{msg}");
    }
    fn error(&self, msg: &str) {
        tracing::error!("{msg}");
    }
    fn summary(&self, count: usize, action: &str, elapsed_secs: f64) {
        tracing::info!("{action} {count} item(s) in {elapsed_secs:.2}s");
    }
}
