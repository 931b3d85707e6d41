//! strata-store: Block-file storage
//!
//! A block file holds one contiguous run of samples. Variants:
//! - Simple: samples plus precomputed summaries in one project-local file
//! - Silent: implicit zeros, stores only a length
//! - Alias: samples live in an externally-owned WAV file
//! - On-demand: alias/decode blocks whose summary or data a background task
//!   materialises later
//!
//! Handles are reference counted; a sequence never mutates a block file in
//! place. The [`BlockStore`] trait is the contract the sequence layer
//! programs against; [`DiskBlockStore`] is the production implementation.

mod alias;
mod block;
mod error;
mod silent;
mod simple;
mod store;

pub use alias::*;
pub use block::*;
pub use error::*;
pub use silent::*;
pub use simple::*;
pub use store::*;
