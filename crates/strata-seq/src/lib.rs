//! strata-seq: Block-structured audio sample sequence
//!
//! A [`Sequence`] is a logical, mutable, random-access array of PCM samples
//! of a single channel, backed by an ordered list of bounded-size block files
//! in a [`strata_store::BlockStore`]. Edits (paste, delete, overwrite,
//! silence insertion, streaming append) act on the flat-array view while
//! keeping block sizes balanced, and every mutator gives the strong
//! exception-safety guarantee: it either completes, or fails leaving the
//! sequence exactly as it was.
//!
//! Block files are immutable and reference counted, so sequences share them
//! freely (clips, undo snapshots); "editing" a block always means writing a
//! new file and swapping handles.

mod block;
mod display;
mod error;
mod sequence;
mod xml;

pub use block::*;
pub use error::*;
pub use sequence::*;
