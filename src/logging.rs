//! Optional default logging setup for embedding hosts that don't already
//! manage a `tracing` subscriber.
//!
//! Mirrors the teacher's `main.rs`: logs always go to stderr so stdout stays
//! free for whatever the embedding host wants to put there, and verbosity is
//! controlled by `RUST_LOG` with a sane default.

use tracing_subscriber::EnvFilter;

/// Install a process-wide stderr subscriber at `level` unless `RUST_LOG` is
/// already set, in which case `RUST_LOG` wins. Safe to call once at process
/// startup; calling it twice is a no-op (the second install is dropped).
pub fn init(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}
