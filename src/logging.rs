//! Tracing subscriber setup for binaries and tests embedding the engine.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter used when `RUST_LOG` is not set
pub const DEFAULT_DIRECTIVE: &str = "info,prize_settlement=debug";

/// Install a global fmt subscriber filtered by `RUST_LOG`, falling back to
/// `default_directive`. Errors if a global subscriber is already set.
pub fn init_tracing(default_directive: Option<&str>) -> Result<(), String> {
    let directive = default_directive.unwrap_or(DEFAULT_DIRECTIVE);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive)))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true),
        )
        .try_init()
        .map_err(|e| e.to_string())
}
