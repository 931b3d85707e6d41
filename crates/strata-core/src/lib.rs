//! strata-core: Shared types, traits, and utilities for strata
//!
//! This crate provides the foundational types used across all strata crates:
//! sample formats and conversion, sample-count arithmetic, the process-wide
//! disk-block-size configuration, and the XML emission helpers.

mod config;
mod count;
mod error;
mod sample;
mod xml;

pub use config::*;
pub use count::*;
pub use error::*;
pub use sample::*;
pub use xml::*;
