// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of MaxTilt — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

static INITIALISED: OnceLock<()> = OnceLock::new();

/// Error raised when the global subscriber was already installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyInitialised;

impl core::fmt::Display for AlreadyInitialised {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "tracing subscriber was already initialised")
    }
}

impl std::error::Error for AlreadyInitialised {}

/// Configures the global tracing subscriber. Filtering follows `RUST_LOG`
/// with an `info` fallback; extraction and weight-update events live under
/// the `tilt::` targets at `debug`.
pub fn init_tracing() -> Result<(), AlreadyInitialised> {
    INITIALISED.set(()).map_err(|_| AlreadyInitialised)?;

    let ansi = std::io::stdout().is_terminal();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(ansi);
    Registry::default().with(filter).with(fmt_layer).init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_initialisation_is_rejected() {
        // Whichever call wins the race, the second must fail cleanly.
        let first = init_tracing();
        let second = init_tracing();
        assert!(first.is_ok() || first == Err(AlreadyInitialised));
        assert_eq!(second, Err(AlreadyInitialised));
    }
}
