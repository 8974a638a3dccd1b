// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A `#[test]` attribute that routes `tracing` output to the test harness.

#[cfg(test)]
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

#[doc(hidden)]
/// Installs the global subscriber once per test binary.
///
/// `RUST_LOG` selects targets in the usual `target=level` syntax; an
/// unparsable value falls back to debug for everything.
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = std::env::var("RUST_LOG")
            .ok()
            .and_then(|var| var.parse::<Targets>().ok())
            .unwrap_or_else(|| Targets::new().with_default(LevelFilter::DEBUG));
        let _ = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .try_init();
    });
}
