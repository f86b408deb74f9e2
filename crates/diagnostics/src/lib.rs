// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

//! Logging facade for the authflow workspace
//!
//! Every crate logs through these macros so that a single switch controls
//! verbosity for the verification engine, its adapters and its tests.
//!
//! Usage:
//! - Set AUTHFLOW_LOG=off (default) - no logs
//! - Set AUTHFLOW_LOG=info - fetches issued, streams opened
//! - Set AUTHFLOW_LOG=debug - per-block claim/resolve traces

use std::sync::Once;

// Re-export emit so macros can use it
pub use emit;

/// Environment variable consulted by [`init_diagnostics`].
pub const LOG_ENV: &str = "AUTHFLOW_LOG";

static INIT: Once = Once::new();

fn min_level(value: &str) -> Option<emit::Level> {
    match value {
        "debug" => Some(emit::Level::Debug),
        "info" => Some(emit::Level::Info),
        "warn" => Some(emit::Level::Warn),
        "error" => Some(emit::Level::Error),
        _ => None,
    }
}

/// Initialize diagnostics based on the AUTHFLOW_LOG environment variable
///
/// Safe to call any number of times; only the first call installs the
/// emitter.
pub fn init_diagnostics() {
    INIT.call_once(|| {
        let log_level = std::env::var(LOG_ENV).unwrap_or_else(|_| "off".to_string());
        if log_level == "off" {
            return;
        }

        let level = min_level(&log_level);
        let rt = emit::setup()
            .emit_to(emit_term::stderr())
            .emit_when(emit::level::min_filter(level.unwrap_or(emit::Level::Info)))
            .init();

        if level.is_none() {
            let value = log_level.as_str();
            emit::warn!("unknown {env} value {value}, using info", env: LOG_ENV, value: value);
        }

        // The runtime must outlive every task that logs.
        std::mem::forget(rt);
    });
}

/// Log basic operations: fetches issued, streams opened and closed.
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

/// Log detailed diagnostics: block claims, resolutions, proof sizes.
#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

/// Log conditions worth noticing that do not stop the engine, such as a
/// rejected proof.
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

/// Log failures that leave an operation unusable.
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::emit::info!($($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::emit::debug!($($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::emit::warn!($($arg)*)
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::emit::error!($($arg)*)
    };
}

pub use init_diagnostics as init;
