//! Linear optics of periodic accelerator lattices.
//!
//! A ring is a cyclic sequence of 6×6 element transfer matrices. [`optics::accumulate`]
//! composes them around the ring from any start element, [`optics::ranges`] composes
//! independent (possibly wrapping) segments, [`optics::twiss`] propagates a reference
//! optics vector through the accumulated maps and [`optics::periodic`] finds the matched
//! solution of the one-turn map. [`optics::RingOptics`] ties these together with caching.
//!
//! Every batch operation takes a [`utilities::enums::Kernel`]: `Scalar` is the sequential
//! reference loop, `Parallel` runs on the rayon pool and `Auto` picks by work size.

#![allow(clippy::needless_range_loop)]

pub mod optics;
pub mod utilities;
