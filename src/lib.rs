//! Prior box (anchor) generation for Single Shot MultiBox Detectors.
//!
//! The main entry point is [`detection::ssd::Anchors::calculate`], which turns an
//! [`detection::ssd::AnchorParams`] description of an SSD network's feature map pyramid into the
//! ordered table of prior boxes the network's outputs are decoded against.
//!
//! # Environment Variables
//!
//! * `RUST_LOG`: overrides the log filter installed by [`init_logger!`].

use log::LevelFilter;

pub mod detection;
pub mod iter;

/// macro-use only, not part of public API.
#[doc(hidden)]
pub fn init_logger(calling_crate: &'static str) {
    let log_level = LevelFilter::Debug;
    env_logger::Builder::new()
        .filter(Some(calling_crate), log_level)
        .filter(Some(env!("CARGO_CRATE_NAME")), log_level)
        .parse_default_env()
        .try_init()
        .ok();
}

/// Initializes logging to *stderr*.
///
/// The calling crate and this library will log at *debug* level, unless overridden by `RUST_LOG`.
///
/// If a global logger is already registered, this macro will do nothing.
#[macro_export]
macro_rules! init_logger {
    () => {
        $crate::init_logger(env!("CARGO_CRATE_NAME"))
    };
}
