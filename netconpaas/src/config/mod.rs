pub mod client;
pub use client::{ClientConfig, ClientConfigCli};

/// Keeps the subscriber installed and the file writer flushing for as long
/// as it is alive.
pub struct TracingGuard {
    pub subscriber_guard: Option<tracing::subscriber::DefaultGuard>,
    pub file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}
