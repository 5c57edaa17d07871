use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::DEBUG;

/// Install the global `tracing` subscriber.
///
/// `FLUXDECLIP_DEBUG=1` raises the default level to `DEBUG`; `RUST_LOG` directives still apply.
/// Calling this more than once is a no-op.
pub fn initialize_logging() {
    let is_debug = std::env::var("FLUXDECLIP_DEBUG")
        .unwrap_or_default()
        .contains('1');
    DEBUG.store(is_debug, std::sync::atomic::Ordering::Relaxed);

    let filter = EnvFilter::builder()
        .with_default_directive(if is_debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
