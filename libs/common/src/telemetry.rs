//! Tracing bootstrap shared by the service binaries

use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_directive` (e.g. `"info"`) is used.
/// Calling this twice is harmless: the second installation is ignored.
pub fn init_tracing(default_directive: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Shorten an opaque secret identifier for log output.
pub fn redact(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}
