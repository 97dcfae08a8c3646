//! Common functionality for object detection.
//!
//! Detector-specific decoding lives outside of this crate. The functionality defined here is
//! meant to be shared by every SSD-style detector.

pub mod ssd;
