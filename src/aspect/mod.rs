//! Aspect ratios and projector lens-memory commands
//!
//! An `AspectRatio` is what the content wants; a `LensCommand` is what the
//! projector understands. `LensMap` is the fixed table between the two.

pub mod lens;
pub mod ratio;

pub use lens::{LensBand, LensCommand, LensMap};
pub use ratio::AspectRatio;
