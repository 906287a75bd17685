//! Operation logging
//!
//! Every line about queued work carries the same structured fields, so one
//! repository or one operation can be followed through the log:
//!
//! - `repository`: canonical directory of the context
//! - `operation_id`: `op-N`, assigned at enqueue
//! - `kind`: `clone` or `fetch`
//! - `generation`: SSH agent binding the line refers to
//!
//! Outcome events are logged at `info` on success and `warn` on failure
//! by the notifier; queue transitions are `debug`, dequeue timing `trace`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the stderr subscriber, filtered by `RUST_LOG` (default `warn`)
///
/// - `RUST_LOG=info`: operation start, success and failure
/// - `RUST_LOG=gitopsd=debug`: queue transitions and agent handshakes
/// - `RUST_LOG=gitopsd::registry=trace`: per-operation wait times
///
/// Fails if a subscriber is already installed.
pub fn init() -> crate::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // Thread ids matter here: operations run on blocking workers
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| crate::GitOpsError::Other(format!("Failed to initialize tracing: {}", e)))?;

    Ok(())
}

/// Initialize logging for tests (no-op if already initialized)
pub fn init_test() {
    let _ = init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_test_helper() {
        // Should never panic
        init_test();
        init_test();
    }

    #[test]
    fn test_structured_logging() {
        init_test();

        tracing::info!(
            repository = "/tmp/r1",
            operation_id = "op-1",
            kind = "fetch",
            "Operation started"
        );
    }
}
