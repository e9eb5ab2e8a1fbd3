use std::sync::Once;

use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize a process-wide tracing subscriber once: compact fmt output,
/// level from `RUST_LOG` (default `info`). Intended for test binaries and
/// example programs; applications embedding the crate usually install
/// their own subscriber instead.
pub fn init() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(build_env_filter())
            .with_target(true)
            .with_level(true)
            .compact()
            .init();
    });
}

/// Run an async test body with tracing initialized.
pub async fn with_test_tracing<F, Fut, T>(f: F) -> T
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    init();
    f().await
}
