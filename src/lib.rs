//! # entangle
//!
//! Settings and the demo service behind the `entangle` binary.

#![deny(unsafe_code)]

pub mod demo;
pub mod settings;

pub use settings::{EntangleSettings, load_settings_from_path};
